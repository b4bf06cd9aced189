pub mod energy_usage_queries;
