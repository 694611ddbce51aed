mod cache_tests;
mod common;
mod database_tests;
mod job_backend_tests;
mod pipeline_tests;
