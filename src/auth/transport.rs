use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::http::header::AUTHORIZATION;
use actix_web::{HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde_json::json;

use super::sessions::TokenPair;
use crate::config::{CookieConfig, SameSitePolicy};
use crate::db::ClientBinding;
use crate::error::AppError;
use crate::Result;

pub const DEVICE_ID_HEADER: &str = "X-Device-ID";

impl ClientBinding {
    /// Mobile clients identify themselves with a device header; everyone
    /// else is bound to the peer address.
    pub fn from_request(req: &HttpRequest) -> Result<Self> {
        let device = req
            .headers()
            .get(DEVICE_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(device) = device {
            return Ok(ClientBinding::Device(device.to_string()));
        }

        peer_ip(req).map(ClientBinding::Ip)
    }
}

/// Network address of the caller, whatever headers it sent.
pub fn peer_ip(req: &HttpRequest) -> Result<String> {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| AppError::ValidationError("Client address unavailable".to_string()))
}

pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Web clients get their tokens as cookies, mobile clients in the body.
#[derive(Debug, Clone)]
pub struct TokenDelivery {
    cookies: CookieConfig,
}

impl TokenDelivery {
    pub fn new(cookies: CookieConfig) -> Self {
        Self { cookies }
    }

    pub fn respond(&self, binding: &ClientBinding, pair: &TokenPair, now: DateTime<Utc>) -> HttpResponse {
        if binding.is_mobile() {
            return HttpResponse::Ok().json(pair);
        }

        HttpResponse::Ok()
            .cookie(self.cookie(
                &self.cookies.access_name,
                &pair.access_token,
                &self.cookies.access_path,
                pair.access_expires_at,
                now,
            ))
            .cookie(self.cookie(
                &self.cookies.refresh_name,
                &pair.refresh_token,
                &self.cookies.refresh_path,
                pair.refresh_expires_at,
                now,
            ))
            .json(json!({
                "principal_id": pair.principal_id,
                "access_expires_at": pair.access_expires_at,
                "refresh_expires_at": pair.refresh_expires_at,
            }))
    }

    /// Response for logout: both cookies expired.
    pub fn clear(&self) -> HttpResponse {
        let mut access = self.base_cookie(&self.cookies.access_name, "", &self.cookies.access_path);
        access.make_removal();
        let mut refresh =
            self.base_cookie(&self.cookies.refresh_name, "", &self.cookies.refresh_path);
        refresh.make_removal();

        HttpResponse::NoContent().cookie(access).cookie(refresh).finish()
    }

    /// Refresh token from the cookie, falling back to the value a mobile
    /// client posted in the body.
    pub fn refresh_token(&self, req: &HttpRequest, body_token: Option<&str>) -> Option<String> {
        req.cookie(&self.cookies.refresh_name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| body_token.map(str::to_string))
    }

    fn cookie(
        &self,
        name: &str,
        value: &str,
        path: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Cookie<'static> {
        let mut cookie = self.base_cookie(name, value, path);
        cookie.set_max_age(CookieDuration::seconds((expires_at - now).num_seconds().max(0)));
        cookie
    }

    fn base_cookie(&self, name: &str, value: &str, path: &str) -> Cookie<'static> {
        let same_site = match self.cookies.same_site {
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::Lax => SameSite::Lax,
        };

        Cookie::build(name.to_string(), value.to_string())
            .path(path.to_string())
            .secure(self.cookies.secure)
            .http_only(true)
            .same_site(same_site)
            .finish()
    }
}
