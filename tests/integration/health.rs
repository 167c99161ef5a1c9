use rocket::http::Status;

use crate::common::test_client;

#[rocket::async_test]
async fn test_health_reports_instance_and_backends() {
    let Some(client) = test_client().await else {
        return;
    };

    let res = client.get("/health").dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    assert!(res.headers().get_one("X-Instance-Id").is_some());

    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert!(!body["instanceId"].as_str().unwrap().is_empty());
    assert_eq!(body["db"], "ok");
    // No BUS_URL in the test config: explicitly standalone, never silent.
    assert_eq!(body["bus"], "standalone");
    assert!(body["songCount"].as_i64().unwrap() >= 0);
}

#[rocket::async_test]
async fn test_every_response_carries_instance_header() {
    let Some(client) = test_client().await else {
        return;
    };

    let res = client.get("/rooms").dispatch().await;
    assert!(res.headers().get_one("X-Instance-Id").is_some());

    // Even 404s are attributable to an instance.
    let res = client.get("/nope").dispatch().await;
    assert_eq!(res.status(), Status::NotFound);
    assert!(res.headers().get_one("X-Instance-Id").is_some());
}
