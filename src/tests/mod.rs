pub mod test_helpers;

mod lifecycle_tests;
