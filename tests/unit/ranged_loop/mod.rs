pub mod metrics_config_test;
