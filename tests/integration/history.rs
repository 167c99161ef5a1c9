use rocket::http::Status;

use crate::common::test_client;

#[rocket::async_test]
async fn test_unknown_room_history_is_empty() {
    let Some(client) = test_client().await else {
        return;
    };

    let room = format!("test-{}", uuid::Uuid::new_v4().simple());
    let res = client
        .get(format!("/rooms/{room}/messages?limit=20"))
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let page: Vec<serde_json::Value> = res.into_json().await.unwrap();
    assert!(page.is_empty());
}

#[rocket::async_test]
async fn test_before_cursor_must_be_a_message_id() {
    let Some(client) = test_client().await else {
        return;
    };

    let res = client
        .get("/rooms/default/messages?before=not-a-uuid")
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("before"));
}

#[rocket::async_test]
async fn test_limit_is_clamped() {
    let Some(client) = test_client().await else {
        return;
    };

    // Out-of-range limits are clamped, not rejected.
    for query in ["limit=0", "limit=100000"] {
        let res = client
            .get(format!("/rooms/default/messages?{query}"))
            .dispatch()
            .await;
        assert_eq!(res.status(), Status::Ok);
        let page: Vec<serde_json::Value> = res.into_json().await.unwrap();
        assert!(page.len() <= 100);
    }
}

#[rocket::async_test]
async fn test_history_is_newest_first_with_reactions_field() {
    let Some(client) = test_client().await else {
        return;
    };

    let res = client
        .get("/rooms/default/messages?limit=20")
        .dispatch()
        .await;
    assert_eq!(res.status(), Status::Ok);
    let page: Vec<serde_json::Value> = res.into_json().await.unwrap();

    for message in &page {
        assert!(message["reactions"].is_array());
        assert!(message.get("createdAt").is_some());
        assert!(message.get("durable").is_some());
    }
    for pair in page.windows(2) {
        let newer = pair[0]["createdAt"].as_str().unwrap();
        let older = pair[1]["createdAt"].as_str().unwrap();
        assert!(newer >= older);
    }
}
