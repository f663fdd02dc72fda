// SPDX-License-Identifier: GPL-2.0-or-later

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::{header, HeaderValue, Method, StatusCode};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct CorsSettings {
    pub enabled: bool,

    // Exact origins, or a single "*".
    pub allowed_origins: Vec<String>,

    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_seconds: u32,
    pub allow_credentials: bool,
}

impl CorsSettings {
    fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allows_any_origin() || self.allowed_origins.iter().any(|o| o == origin)
    }

    // The Access-Control-Allow-Origin value for an allowed origin.
    // Credentialed responses must echo the origin, never "*".
    fn allow_origin_value(&self, origin: &str) -> String {
        if self.allows_any_origin() && !self.allow_credentials {
            "*".to_owned()
        } else {
            origin.to_owned()
        }
    }
}

pub async fn cors(
    State(settings): State<Arc<CorsSettings>>,
    request: Request,
    next: Next,
) -> Response {
    if !settings.enabled {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);

    let Some(origin) = origin else {
        // Same-origin request.
        return next.run(request).await;
    };

    if !settings.origin_allowed(&origin) {
        return next.run(request).await;
    }

    let allow_origin = settings.allow_origin_value(&origin);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        insert(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &allow_origin);
        insert(
            headers,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            &settings.allowed_methods.join(", "),
        );
        insert(
            headers,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            &settings.allowed_headers.join(", "),
        );
        insert(
            headers,
            header::ACCESS_CONTROL_MAX_AGE,
            &settings.max_age_seconds.to_string(),
        );
        if settings.allow_credentials {
            insert(headers, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    insert(headers, header::ACCESS_CONTROL_ALLOW_ORIGIN, &allow_origin);
    if settings.allow_credentials {
        insert(headers, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
    }
    response
}

fn insert(headers: &mut http::HeaderMap, name: http::header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
