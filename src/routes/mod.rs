//! Route table.
//!
//! - **Management** (admin or root role, bucket owner)
//!   - `POST   /api/manage/buckets` : create bucket
//!   - `PATCH  /api/manage/buckets/{bucket}` : edit availability / quota
//!   - `GET    /api/manage/buckets/{bucket}/files` : list files
//!   - `PATCH  /api/manage/buckets/{bucket}/{file_id}` : rename / change access
//!   - `DELETE /api/manage/buckets/{bucket}/{file_id}` : delete file
//!
//! - **Upload** (bucket owner)
//!   - `POST   /api/buckets/{bucket}?access=` : multipart upload
//!
//! - **Serving** (anonymous allowed)
//!   - `GET|HEAD /buckets/{bucket}/{file_id}`

use crate::{
    handlers::{
        bucket_handlers::{create_bucket, edit_bucket},
        file_handlers::{delete_file, edit_file, fetch_file, list_files, upload_files},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Build the router. `max_upload_bytes` caps the upload route's body.
pub fn routes(max_upload_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // management
        .route("/api/manage/buckets", post(create_bucket))
        .route("/api/manage/buckets/{bucket}", patch(edit_bucket))
        .route("/api/manage/buckets/{bucket}/files", get(list_files))
        .route(
            "/api/manage/buckets/{bucket}/{file_id}",
            patch(edit_file).delete(delete_file),
        )
        // upload
        .route(
            "/api/buckets/{bucket}",
            post(upload_files).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        // serving
        .route("/buckets/{bucket}/{file_id}", get(fetch_file).head(fetch_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        services::coordinator::Coordinator,
        storage::{
            disk::DiskBlobStore,
            sqlite::{SqliteMetadataStore, connect, run_migrations},
        },
    };
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header, request},
        response::Response,
    };
    use serde_json::{Value, json};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use uuid::Uuid;

    const BOUNDARY: &str = "XBOUNDARYX";

    async fn app() -> (Router, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = connect(&url, 4).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let blobs_dir = dir.path().join("blobs");
        std::fs::create_dir_all(&blobs_dir).unwrap();

        let coordinator =
            Coordinator::new(SqliteMetadataStore::new(pool), DiskBlobStore::new(blobs_dir))
                .with_default_size_quota(5.0);
        let state = AppState::new(coordinator, Duration::from_secs(10));
        (routes(1024 * 1024).with_state(state), dir)
    }

    fn as_user(builder: request::Builder, user: Uuid, role: &str) -> request::Builder {
        builder
            .header("x-user-id", user.to_string())
            .header("x-user-role", role)
    }

    fn json_request(
        method: &str,
        uri: &str,
        user: Option<(Uuid, &str)>,
        body: Value,
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some((id, role)) = user {
            builder = as_user(builder, id, role);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn multipart_request(uri: &str, user: (Uuid, &str), parts: &[(&str, &str)]) -> Request<Body> {
        let mut body = String::new();
        for (filename, content) in parts {
            body.push_str(&format!(
                "--{BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: text/plain\r\n\r\n\
                 {content}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        as_user(Request::builder().method("POST").uri(uri), user.0, user.1)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_bucket(app: &Router, owner: Uuid, name: &str) {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/manage/buckets",
                Some((owner, "admin")),
                json!({ "name": name, "availability": "accessible" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["name"], name);
        assert_eq!(body["sizeQuota"], 5.0);
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let (app, _dir) = app().await;
        let response = app.clone().oneshot(get("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(get("/readyz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn management_needs_identity_and_role() {
        let (app, _dir) = app().await;
        let body = json!({ "name": "some-bucket" });

        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/manage/buckets", None, body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/manage/buckets",
                Some((Uuid::new_v4(), "user")),
                body.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let owner = Uuid::new_v4();
        create_bucket(&app, owner, "some-bucket").await;
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/manage/buckets",
                Some((owner, "root")),
                body,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn upload_serve_edit_delete_round() {
        let (app, _dir) = app().await;
        let owner = Uuid::new_v4();
        create_bucket(&app, owner, "media-bucket").await;

        let response = app
            .clone()
            .oneshot(multipart_request(
                "/api/buckets/media-bucket?access=public",
                (owner, "admin"),
                &[("hello.txt", "first"), ("hello.txt", "second")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let results = json_body(response).await["results"].clone();
        assert_eq!(results.as_array().unwrap().len(), 2);
        assert!(results.as_array().unwrap().iter().all(|r| r["result"] == "ok"));
        let second: Uuid = serde_json::from_value(results[1]["id"].clone()).unwrap();

        // Anonymous fetch of a public file in an accessible bucket.
        let uri = format!("/buckets/media-bucket/{second}");
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"hello_1.txt\""
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"second");

        // Listing renders display names.
        let response = app
            .clone()
            .oneshot(
                as_user(
                    Request::builder().uri("/api/manage/buckets/media-bucket/files"),
                    owner,
                    "admin",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listing = json_body(response).await;
        let names: Vec<&str> = listing["files"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["hello.txt", "hello_1.txt"]);

        // Making it private hides it from anonymous callers.
        let edit_uri = format!("/api/manage/buckets/media-bucket/{second}");
        let response = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                &edit_uri,
                Some((owner, "admin")),
                json!({ "access": "private" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["access"], "private");
        let response = app.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(
                as_user(Request::builder().method("DELETE").uri(&edit_uri), owner, "admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = app.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_by_non_owner_reports_per_item_errors() {
        let (app, _dir) = app().await;
        create_bucket(&app, Uuid::new_v4(), "other-bucket").await;

        let response = app
            .oneshot(multipart_request(
                "/api/buckets/other-bucket",
                (Uuid::new_v4(), "admin"),
                &[("a.txt", "a")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["results"][0]["result"], "error");
        assert_eq!(body["results"][0]["name"], "a.txt");
        assert!(body["results"][0].get("id").is_none());
    }

    #[tokio::test]
    async fn upload_needs_a_managing_role() {
        let (app, _dir) = app().await;
        let owner = Uuid::new_v4();
        create_bucket(&app, owner, "role-bucket").await;

        let response = app
            .clone()
            .oneshot(multipart_request(
                "/api/buckets/role-bucket",
                (owner, "user"),
                &[("a.txt", "a")],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(
                as_user(
                    Request::builder().uri("/api/manage/buckets/role-bucket/files"),
                    owner,
                    "admin",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(response).await["files"], json!([]));
    }
}
