// Ranged loop lifecycle, sequence, metrics and configuration tests
pub mod ranged_loop;
