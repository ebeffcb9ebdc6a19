#![cfg(unix)]

mod common;

use axum::http::StatusCode;
use db::repositories::JobRepository;
use scan_core::{Dimensions, JobId, JobRecord};

use common::*;

#[tokio::test]
async fn submitted_job_completes_and_serves_its_artifacts() {
    let app = setup().await;
    let job_id = app.submit_ok().await;

    let status = app.wait_terminal(&job_id).await;
    assert_eq!(status["status"], "completed", "{status}");
    assert_eq!(status["progress"]["current"], status["progress"]["total"]);
    assert_eq!(status["progress"]["percent"], 100.0);
    assert_eq!(status["photo_count"], 3);
    assert!(status.get("error").is_none());

    let obj = app
        .get(&format!("/jobs/{job_id}/artifact?format=obj"))
        .await;
    assert_eq!(obj.status(), StatusCode::OK);
    assert_eq!(obj.headers()["content-type"], "model/obj");
    let obj = body_bytes(obj).await;
    let text = String::from_utf8_lossy(&obj);
    assert_eq!(text.lines().filter(|l| l.starts_with("v ")).count(), 4);

    let first = body_bytes(app.get(&format!("/jobs/{job_id}/artifact?format=ply")).await).await;
    let second = body_bytes(app.get(&format!("/jobs/{job_id}/artifact?format=PLY")).await).await;
    assert_eq!(first, second);
    assert!(String::from_utf8_lossy(&first).contains("element vertex 4"));

    let bundle = app.get(&format!("/jobs/{job_id}/bundle")).await;
    assert_eq!(bundle.status(), StatusCode::OK);
    assert_eq!(bundle.headers()["content-type"], "application/zip");
    let bundle = body_bytes(bundle).await;
    let archive = zip::ZipArchive::new(std::io::Cursor::new(bundle.to_vec())).unwrap();
    assert_eq!(archive.len(), 3);

    let list = body_json(app.get("/jobs?status=completed").await).await;
    assert_eq!(list["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(list["jobs"][0]["job_id"], job_id.as_str());

    let stats = body_json(app.get("/stats").await).await;
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["by_status"]["completed"], 1);
    assert_eq!(stats["by_status"]["queued"], 0);

    app.shutdown().await;
}

#[tokio::test]
async fn invalid_submissions_are_rejected_before_any_record_exists() {
    let app = setup().await;
    let with_images = bundle(3, None);
    let without_images = bundle(0, Some(METADATA));

    let cases: Vec<(&str, Vec<Part<'_>>)> = vec![
        ("missing bundle", vec![Part::Text("metadata", METADATA)]),
        ("missing metadata", vec![Part::File("bundle", &with_images)]),
        (
            "not a zip",
            vec![
                Part::File("bundle", b"definitely not a zip"),
                Part::Text("metadata", METADATA),
            ],
        ),
        ("no images", vec![Part::File("bundle", &without_images)]),
        (
            "zero photos",
            vec![
                Part::File("bundle", &with_images),
                Part::Text(
                    "metadata",
                    r#"{"photoCount": 0, "dimensions": {"length": 1, "width": 1, "height": 1}}"#,
                ),
            ],
        ),
        (
            "negative dimension",
            vec![
                Part::File("bundle", &with_images),
                Part::Text("metadata", METADATA),
                Part::Text("height", "-4"),
            ],
        ),
        (
            "non-numeric dimension",
            vec![
                Part::File("bundle", &with_images),
                Part::Text("metadata", METADATA),
                Part::Text("width", "wide"),
            ],
        ),
    ];

    for (name, parts) in cases {
        let response = app.submit(&parts).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{name}");
        let json = body_json(response).await;
        assert_eq!(json["code"], "INVALID_INPUT", "{name}: {json}");
    }

    let stats = body_json(app.get("/stats").await).await;
    assert_eq!(stats["total"], 0);

    app.shutdown().await;
}

#[tokio::test]
async fn bundled_metadata_is_used_and_fields_override_it() {
    let app = setup().await;
    let bundle = bundle(3, Some(METADATA));

    let response = app
        .submit(&[
            Part::File("zipfile", &bundle),
            Part::Text("length", "75.5"),
            Part::Text("captureMode", "circular"),
        ])
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let job_id = body_json(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let status = app.wait_terminal(&job_id).await;
    assert_eq!(status["dimensions"]["length"], 75.5);
    assert_eq!(status["dimensions"]["width"], 40.0);
    assert_eq!(status["dimensions"]["height"], 100.0);

    app.shutdown().await;
}

#[tokio::test]
async fn artifact_requests_follow_the_job_state() {
    let app = setup().await;

    // A record with no delivery stays queued while this pool runs.
    let queued = JobRecord::new(2, Dimensions::new(10.0, 10.0, 10.0).unwrap()).unwrap();
    JobRepository::insert(&queued).await.unwrap();

    let response = app
        .get(&format!("/jobs/{}/artifact?format=obj", queued.id))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "NOT_READY");

    let status = body_json(app.get(&format!("/jobs/{}", queued.id)).await).await;
    assert_eq!(status["status"], "queued");
    assert!(status["stage"].is_null());

    let response = app
        .get(&format!("/jobs/{}/artifact?format=fbx", queued.id))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "UNSUPPORTED_FORMAT");

    let response = app.get(&format!("/jobs/{}/artifact", JobId::new())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.get("/jobs/not-a-job").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.get(&format!("/jobs/{}/bundle", JobId::new())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.shutdown().await;
}

#[tokio::test]
async fn failed_job_reports_diagnostics_and_never_an_artifact() {
    let app = setup_with(failing_pipeline()).await;
    let job_id = app.submit_ok().await;

    let status = app.wait_terminal(&job_id).await;
    assert_eq!(status["status"], "failed");
    assert_eq!(status["stage"], "export");
    assert_eq!(status["error"]["stage"], "export");
    assert_eq!(status["error"]["exit_code"], 3);
    assert!(
        status["error"]["output_tail"]
            .as_str()
            .unwrap()
            .contains("no model written")
    );
    assert!(status.get("artifact_path").is_none());

    let response = app
        .get(&format!("/jobs/{job_id}/artifact?format=ply"))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["code"], "JOB_FAILED");

    app.shutdown().await;
}

#[tokio::test]
async fn concurrent_submissions_get_distinct_records() {
    let app = setup().await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(app.submit_ok().await);
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    for id in &ids {
        let status = app.wait_terminal(id).await;
        assert_eq!(status["job_id"], id.as_str());
        assert_eq!(status["status"], "completed");
    }

    let list = body_json(app.get("/jobs?limit=2").await).await;
    assert_eq!(list["jobs"].as_array().unwrap().len(), 2);
    assert_eq!(list["limit"], 2);

    let response = app.get("/jobs?status=paused").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.shutdown().await;
}

#[tokio::test]
async fn event_stream_is_served_as_sse() {
    let app = setup().await;

    let response = app.get("/events").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    drop(response);

    let response = app.get("/events?job_id=nope").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.shutdown().await;
}

#[tokio::test]
async fn a_submission_the_store_rejects_leaves_no_workspace() {
    let app = setup().await;
    let db = db::get_db().unwrap();
    db.query("DEFINE FIELD OVERWRITE created_ms ON scan_job TYPE int ASSERT $value < 0;")
        .await
        .unwrap()
        .check()
        .unwrap();

    let bundle = bundle(3, None);
    let response = app
        .submit(&[Part::File("bundle", &bundle), Part::Text("metadata", METADATA)])
        .await;

    db.query("DEFINE FIELD OVERWRITE created_ms ON scan_job TYPE int;")
        .await
        .unwrap()
        .check()
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["code"], "INTERNAL_ERROR");
    let leftovers = std::fs::read_dir(app.dir.path().join("workspace"))
        .unwrap()
        .count();
    assert_eq!(leftovers, 0);

    app.shutdown().await;
}
