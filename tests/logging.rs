use tensorserve_core::{logging, ErrorCode, LoggingOptions};

// Installs the global subscriber, so it lives in its own test binary.
#[test]
fn test_second_init_is_rejected() {
    let options = LoggingOptions {
        level: "warn".to_string(),
        filter: None,
    };
    logging::init(&options).unwrap();
    let err = logging::init(&options).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AlreadyExists);

    let bad = LoggingOptions {
        level: "loud".to_string(),
        filter: None,
    };
    assert_eq!(logging::init(&bad).unwrap_err().code(), ErrorCode::InvalidArg);
}
