use std::collections::HashMap;
use std::path::Path;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use batch_geocoder::{
    parse_records, write_results, AppError, BatchOrchestrator, GeocodeStatus, GeocoderConfig,
    ResultSource,
};

const INPUT_CSV: &str = "id,address\n\
1,\"10 Downing St, London SW1A 2AA\"\n\
2,\"Nowhere Lane, Atlantis\"\n\
3,\"Broken ^^ Query\"\n";

fn config_for(server: &Server, cache_path: &Path) -> GeocoderConfig {
    let values: HashMap<&str, String> = HashMap::from([
        ("GEOCODER_USER_AGENT", "batch-geocoder-integration".to_string()),
        ("GEOCODER_CACHE_PATH", cache_path.display().to_string()),
        ("GEOCODER_ENDPOINT", server.url_str("/search")),
        ("GEOCODER_RATE_LIMIT_SECONDS", "0.05".to_string()),
        ("GEOCODER_MAX_RETRIES", "3".to_string()),
        ("GEOCODER_CONCURRENCY", "3".to_string()),
        ("GEOCODER_BASE_BACKOFF_MS", "10".to_string()),
    ]);
    GeocoderConfig::from_lookup(|key: &str| values.get(key).cloned()).unwrap()
}

#[tokio::test]
async fn geocodes_csv_and_reuses_cache_on_rerun() {
    let dir = tempdir().unwrap();
    let cache_path = dir.path().join("geocode-cache.json");
    let records = parse_records(csv::Reader::from_reader(INPUT_CSV.as_bytes())).unwrap();

    let mut server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "SW1A 2AA, UK")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!([
            { "lat": "51.5034", "lon": "-0.1276", "display_name": "10 Downing Street" }
        ]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Nowhere Lane, Atlantis")))),
        ])
        .times(1)
        .respond_with(json_encoded(json!([]))),
    );
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Broken ^^ Query")))),
        ])
        .times(1)
        .respond_with(status_code(400)),
    );

    let config = config_for(&server, &cache_path);
    let report = BatchOrchestrator::new(&config)
        .unwrap()
        .run(records.clone(), None)
        .await
        .unwrap();

    let statuses: Vec<_> = report
        .results
        .iter()
        .map(|r| (r.id.as_str(), r.result.status, r.result.source))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("1", GeocodeStatus::Ok, ResultSource::Postcode),
            ("2", GeocodeStatus::NotFound, ResultSource::Address),
            ("3", GeocodeStatus::Error, ResultSource::Address),
        ]
    );
    assert_eq!(report.summary.ok, 1);
    assert_eq!(report.summary.not_found, 1);
    assert_eq!(report.summary.error, 1);
    assert_eq!(report.summary.external_calls, 3);

    let output = dir.path().join("results.csv");
    write_results(&output, &report.results).unwrap();
    let written = std::fs::read_to_string(&output).unwrap();
    assert!(written.starts_with("id,latitude,longitude,status,source\n"));
    assert!(written.contains("1,51.5034,-0.1276,OK,POSTCODE"));
    assert!(written.contains("2,,,NOT_FOUND,ADDRESS"));
    assert!(written.contains("3,,,ERROR,ADDRESS"));
    server.verify_and_clear();

    // Second run: OK and NOT_FOUND come from the cache, the rejected query is asked again.
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Broken ^^ Query")))),
        ])
        .times(1)
        .respond_with(status_code(400)),
    );
    let rerun = BatchOrchestrator::new(&config)
        .unwrap()
        .run(records, None)
        .await
        .unwrap();

    assert_eq!(rerun.results[0].result.source, ResultSource::Cache);
    assert_eq!(rerun.results[0].result.latitude, Some(51.5034));
    assert_eq!(rerun.results[1].result.source, ResultSource::Cache);
    assert_eq!(rerun.results[1].result.status, GeocodeStatus::NotFound);
    assert_eq!(rerun.results[2].result.status, GeocodeStatus::Error);
    assert_eq!(rerun.summary.from_cache, 2);
    assert_eq!(rerun.summary.external_calls, 1);
}

#[tokio::test]
async fn retries_throttled_requests() {
    let dir = tempdir().unwrap();
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .times(3)
            .respond_with(status_code(429)),
    );

    let config = config_for(&server, &dir.path().join("cache.json"));
    let records = parse_records(csv::Reader::from_reader(
        "address\nThrottled Street\n".as_bytes(),
    ))
    .unwrap();
    let report = BatchOrchestrator::new(&config)
        .unwrap()
        .run(records, None)
        .await
        .unwrap();

    assert_eq!(report.results[0].id, "0");
    assert_eq!(report.results[0].result.status, GeocodeStatus::Error);
    assert_eq!(report.summary.external_calls, 3);
}

#[test]
fn missing_user_agent_is_a_config_error() {
    let err = GeocoderConfig::from_lookup(|key: &str| {
        (key == "GEOCODER_CACHE_PATH").then(|| "cache.json".to_string())
    })
    .unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}
