use simout_core::errors::{ErrorInfo, SimoutError, SINK_KEY};
use simout_core::RunCoordinate;

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("coordinate", "(1,1)")
        .with_context("sink", "capture")
}

#[test]
fn stat_error_surface() {
    let err = SimoutError::Stat(sample_info("stat.ordering", "min above mean"));
    assert_eq!(err.code(), "stat.ordering");
    assert!(err.info().context.contains_key("coordinate"));
}

#[test]
fn lifecycle_error_surface() {
    let err = SimoutError::Lifecycle(sample_info("lifecycle.run_not_open", "no open run"));
    assert_eq!(err.info().code, "lifecycle.run_not_open");
}

#[test]
fn sink_error_surface() {
    let err = SimoutError::Sink(sample_info("sink.handle_failed", "disk full"));
    assert_eq!(err.info().context.get("sink").map(String::as_str), Some("capture"));
}

#[test]
fn display_renders_context_and_hint() {
    let err = SimoutError::Ledger(
        ErrorInfo::new("ledger.digest_mismatch", "entry digest differs")
            .with_context("path", "1_2.json")
            .with_hint("delete the entry to rerun the replication"),
    );
    assert_eq!(
        err.to_string(),
        "ledger error [ledger.digest_mismatch] entry digest differs {path=1_2.json}; \
         hint: delete the entry to rerun the replication"
    );
}

#[test]
fn run_and_sink_tags_use_shared_keys() {
    let run = RunCoordinate::new(4, 2).expect("coordinate");
    let cause = SimoutError::Sink(ErrorInfo::new("sink.store_unavailable", "rejected"));
    let err = SimoutError::Sink(
        ErrorInfo::new("sink.handle_failed", "1 sink(s) failed during handle")
            .with_coordinate(run)
            .with_cause("stock", &cause)
            .with_cause("capture", &cause),
    );
    assert_eq!(err.coordinate(), Some("(4,2)"));
    assert_eq!(
        err.info().failed_sinks().collect::<Vec<_>>(),
        vec!["capture", "stock"]
    );
    assert!(err
        .info()
        .context_value("cause.stock")
        .is_some_and(|text| text.contains("[sink.store_unavailable]")));

    let tagged = ErrorInfo::new("sink.missing_field", "no value").with_sink("stock");
    assert_eq!(tagged.context_value(SINK_KEY), Some("stock"));
    assert_eq!(tagged.to_string(), "[sink.missing_field] no value {sink=stock}");
}

#[test]
fn errors_serialize_with_family_tag() {
    let err = SimoutError::Config(ErrorInfo::new("config.read", "missing file"));
    let json = serde_json::to_value(&err).expect("serialize");
    assert_eq!(json["family"], "Config");
    assert_eq!(json["detail"]["code"], "config.read");
    let decoded: SimoutError = serde_json::from_value(json).expect("deserialize");
    assert_eq!(decoded, err);
}
