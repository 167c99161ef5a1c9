use rocket::http::Status;

use crate::common::test_client;

#[rocket::async_test]
async fn test_roster_of_idle_room_is_empty() {
    let Some(client) = test_client().await else {
        return;
    };

    let room = format!("test-{}", uuid::Uuid::new_v4().simple());
    let res = client.get(format!("/rooms/{room}/users")).dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().await.unwrap();
    assert_eq!(body["room"], room);
    assert!(body["users"].as_array().unwrap().is_empty());
}

#[rocket::async_test]
async fn test_rooms_listing_is_available() {
    let Some(client) = test_client().await else {
        return;
    };

    let res = client.get("/rooms").dispatch().await;
    assert_eq!(res.status(), Status::Ok);
    let rooms: Vec<serde_json::Value> = res.into_json().await.unwrap();
    for room in &rooms {
        assert!(room["name"].is_string());
        assert!(room["messageCount"].as_i64().unwrap() >= 0);
    }
}
