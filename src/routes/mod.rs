// Route module decomposition — each surface area in its own file.
// Shared request guards live here; route functions in submodules.

mod messages;
mod presence_routes;
mod rooms;
mod socket;
mod system;

pub use messages::get_messages;
pub use presence_routes::room_users;
pub use rooms::list_rooms;
pub use socket::socket as socket_route;
pub use system::{health, not_found};

use hmac::{Hmac, Mac};
use rocket::request::{FromRequest, Outcome, Request};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Salted IP hash. Raw addresses never reach storage or logs; the hash is
/// only a rate-limiting key.
pub fn hash_ip(secret: &str, ip: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(ip.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

/// Compatible identity input: clients that cannot set a query parameter
/// send the UUID in this header instead.
pub struct UserIdHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for UserIdHeader {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(UserIdHeader(
            req.headers().get_one("X-User-Id").map(String::from),
        ))
    }
}
