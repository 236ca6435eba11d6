mod analyzer_tests;
mod integration;
