pub mod avro_provider_test;
pub mod rocksdb_provider_test;
