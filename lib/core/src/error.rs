//! Error plumbing shared by the workspace.
//!
//! Domain errors live next to the code that raises them (`GraphError`,
//! `NodeError`, `HttpError`, ...). Public entry points wrap them in a
//! `rootcause::Report` so callers can attach their own context as the error
//! moves outward.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    fn fails() -> Result<u8, Boom> {
        let raw: std::result::Result<u8, Boom> = Err(Boom);
        Ok(raw?)
    }

    #[test]
    fn result_type_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.expect("should be ok"), 42);
    }

    #[test]
    fn domain_errors_lift_into_reports() {
        let err = fails().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
