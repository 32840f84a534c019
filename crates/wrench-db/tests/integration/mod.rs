pub mod common;
mod manual_registry_tests;
