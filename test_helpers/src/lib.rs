//! Fixture-loading macros shared by the workspace's `#[cfg(test)]` modules.
//! Every crate that needs a sample OCI document or command-output capture
//! reads it from `test_helpers/test/resources/` through these rather than
//! inlining the JSON/text in the test itself.

#[macro_export]
macro_rules! fixture {
    ($file:expr) => {
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../test_helpers/test/resources/",
            $file
        ))
    };
}

#[macro_export]
macro_rules! bytes_fixture {
    ($file:expr) => {
        include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../test_helpers/test/resources/",
            $file
        ))
    };
}

#[macro_export]
macro_rules! fixture_path {
    ($file:expr) => {
        std::path::Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../test_helpers/test/resources/",
            $file
        ))
    };
}
