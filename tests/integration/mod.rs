// Backend tests - passes over real storage formats
pub mod ranged_loop;
