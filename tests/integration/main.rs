// Each file in the tests directory is its own crate; submodules live here
mod connection_test;
