// Test Module Organization

// Unit tests - in-memory splitters only, no storage
pub mod unit;

// Integration tests - RocksDB and Avro backends on temporary directories
pub mod integration;
