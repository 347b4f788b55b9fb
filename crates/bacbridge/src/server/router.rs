//! HTTP Router
//!
//! JSON endpoints over the feed publisher for trend renderers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bacnet::types::{Device, ObjectType, PropertyIdentifier, PropertyKey};

use super::feed::{FeedPublisher, PointSnapshot};

type ApiError = (StatusCode, String);

/// Create the feed router
pub fn create_router(feed: FeedPublisher) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/devices", get(list_devices))
        .route("/devices/:device_id", get(get_device))
        .route("/overrides", get(list_overrides))
        .route(
            "/points/:device_id/:object_type/:instance/:property",
            get(get_point),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(feed)
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    devices: usize,
}

async fn health_check(State(feed): State<FeedPublisher>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        devices: feed.device_count(),
    })
}

async fn list_devices(State(feed): State<FeedPublisher>) -> Json<Vec<Device>> {
    Json(feed.devices())
}

async fn get_device(
    State(feed): State<FeedPublisher>,
    Path(device_id): Path<u32>,
) -> Result<Json<Device>, ApiError> {
    feed.device(device_id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("Unknown device {}", device_id)))
}

async fn list_overrides(State(feed): State<FeedPublisher>) -> Json<Vec<PointSnapshot>> {
    Json(feed.overrides())
}

async fn get_point(
    State(feed): State<FeedPublisher>,
    Path((device_id, object_type, instance, property)): Path<(u32, String, u32, String)>,
) -> Result<Json<PointSnapshot>, ApiError> {
    let object_type: ObjectType = object_type
        .parse()
        .map_err(|e: crate::Error| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let property: PropertyIdentifier = property
        .parse()
        .map_err(|e: crate::Error| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let key = PropertyKey::new(device_id, object_type, instance, property);
    feed.point(&key)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("No value for {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::cache::ValueCache;
    use crate::bacnet::overrides::OverrideStore;
    use crate::bacnet::registry::DeviceRegistry;
    use crate::bacnet::types::{DeviceMetadata, PropertyValue};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        overrides: Arc<OverrideStore>,
        cache: Arc<ValueCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: Arc::new(DeviceRegistry::new()),
                overrides: Arc::new(OverrideStore::new()),
                cache: Arc::new(ValueCache::new()),
            }
        }

        fn router(&self) -> Router {
            create_router(FeedPublisher::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.overrides),
                Arc::clone(&self.cache),
            ))
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let fixture = Fixture::new();
        let (status, body) = get(fixture.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["devices"], 0);
    }

    #[tokio::test]
    async fn test_devices() {
        let fixture = Fixture::new();
        fixture.registry.upsert(
            2001,
            "192.168.1.20:47808".parse().unwrap(),
            DeviceMetadata {
                vendor_name: Some("Acme Controls".to_string()),
                ..DeviceMetadata::default()
            },
        );

        let (status, body) = get(fixture.router(), "/devices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["device_id"], 2001);
        assert_eq!(body[0]["address"], "192.168.1.20:47808");

        let (status, body) = get(fixture.router(), "/devices/2001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["vendor_name"], "Acme Controls");

        let (status, _) = get(fixture.router(), "/devices/9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_points() {
        let fixture = Fixture::new();
        let key = PropertyKey::present_value(2001, ObjectType::AnalogInput, 1);

        let (status, _) = get(fixture.router(), "/points/2001/ai/1/pv").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        fixture.cache.record(key, PropertyValue::Real(72.5));
        let (status, body) = get(fixture.router(), "/points/2001/analog-input/1/present-value").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "network");
        assert_eq!(body["value"]["type"], "real");
        assert_eq!(body["value"]["value"], 72.5);

        fixture.overrides.set(key, PropertyValue::Real(60.0));
        let (_, body) = get(fixture.router(), "/points/2001/analogInput/1/presentValue").await;
        assert_eq!(body["source"], "override");
        assert_eq!(body["value"]["value"], 60.0);

        let (_, body) = get(fixture.router(), "/overrides").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = get(fixture.router(), "/points/2001/thermostat/1/pv").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
