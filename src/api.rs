use actix_web::{web, App, HttpResponse, HttpServer, Result as ActixResult};
use futures::stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::engine::{ExecutionRequest, RunManager, RunState};
use crate::error::{ErrorInfo, ErrorKind, ScraperError};
use crate::storage::RunRecord;

/// API response for a started run
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub run_id: Uuid,
}

/// API response for run details
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    pub run_id: Uuid,
    /// Live state, or the exit result of an evicted run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<RunRecord>,
}

/// Configure API routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/runs", web::post().to(execute_run))
            .route("/runs/{run_id}", web::get().to(get_run))
            .route("/runs/{run_id}/terminate", web::post().to(terminate_run))
            .route("/runs/{run_id}/events", web::get().to(stream_events))
            .route("/health", web::get().to(health_check)),
    );
}

/// Serves the API until the server is stopped
pub async fn serve(manager: RunManager, config: &ApiConfig) -> anyhow::Result<()> {
    info!("API listening on {}:{}", config.host, config.port);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(manager.clone()))
            .configure(configure_routes)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;
    Ok(())
}

fn error_response(error: &ScraperError) -> HttpResponse {
    let body = ErrorInfo::new(error);
    match error.kind() {
        ErrorKind::ScraperNotFound | ErrorKind::RunNotFound => HttpResponse::NotFound().json(body),
        ErrorKind::InvalidIterator | ErrorKind::InvalidProgram => HttpResponse::BadRequest().json(body),
        _ => {
            error!("API: {}", error);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid, HttpResponse> {
    Uuid::parse_str(raw).map_err(|_| {
        error_response(&ScraperError::RunNotFound {
            run_id: raw.to_string(),
        })
    })
}

/// Start a run of a saved scraper
async fn execute_run(manager: web::Data<RunManager>, req: web::Json<ExecutionRequest>) -> ActixResult<HttpResponse> {
    info!("API: Executing scraper {}", req.scraper_id);

    match manager.execute(req.into_inner()).await {
        Ok(run_id) => Ok(HttpResponse::Accepted().json(ExecutionResponse { run_id })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Get run state and its persisted record
async fn get_run(manager: web::Data<RunManager>, path: web::Path<String>) -> ActixResult<HttpResponse> {
    let run_id = match parse_run_id(&path) {
        Ok(run_id) => run_id,
        Err(response) => return Ok(response),
    };

    let record = match manager.run_record(run_id).await {
        Ok(record) => record,
        Err(e) => return Ok(error_response(&e)),
    };
    let state = manager.state(run_id).await.ok();
    if state.is_none() && record.is_none() {
        return Ok(error_response(&ScraperError::RunNotFound {
            run_id: run_id.to_string(),
        }));
    }

    Ok(HttpResponse::Ok().json(RunDetails { run_id, state, record }))
}

/// Request termination; repeated calls are acknowledged
async fn terminate_run(manager: web::Data<RunManager>, path: web::Path<String>) -> ActixResult<HttpResponse> {
    let run_id = match parse_run_id(&path) {
        Ok(run_id) => run_id,
        Err(response) => return Ok(response),
    };
    info!("API: Terminating run {}", run_id);

    match manager.terminate(run_id).await {
        Ok(ack) => Ok(HttpResponse::Ok().json(ack)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Live telemetry as server-sent events, one envelope per message
async fn stream_events(manager: web::Data<RunManager>, path: web::Path<String>) -> ActixResult<HttpResponse> {
    let run_id = match parse_run_id(&path) {
        Ok(run_id) => run_id,
        Err(response) => return Ok(response),
    };

    let receiver = match manager.subscribe(run_id).await {
        Ok(Some(receiver)) => receiver,
        // Already exited: nothing live left to send
        Ok(None) => return Ok(HttpResponse::NoContent().finish()),
        Err(e) => return Ok(error_response(&e)),
    };

    let events = stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    let frame = match serde_json::to_string(&envelope) {
                        Ok(json) => format!("data: {}\n\n", json),
                        Err(e) => {
                            warn!("API: Dropping unserializable event: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok::<_, actix_web::Error>(web::Bytes::from(frame)), receiver));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("API: Subscriber of run {} lagged by {} events", run_id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events))
}

/// Health check endpoint
async fn health_check(manager: web::Data<RunManager>) -> ActixResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "activeRuns": manager.active_runs().len(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::page::{FixturePageSource, StaticBrowser};
    use crate::program::{Program, ScraperInstruction};
    use crate::storage::StorageManager;
    use crate::store::MemoryDataStore;
    use actix_web::{http::StatusCode, test};
    use std::sync::Arc;

    fn manager() -> RunManager {
        RunManager::new(
            AppConfig::default(),
            StorageManager::in_memory().unwrap(),
            Arc::new(MemoryDataStore::new()),
            Arc::new(StaticBrowser::new(Arc::new(FixturePageSource::new()))),
        )
    }

    #[actix_rt::test]
    async fn test_health_and_unknown_ids() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(manager()))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["activeRuns"], 0);

        let uri = format!("/api/v1/runs/{}/terminate", Uuid::new_v4());
        let resp = test::call_service(&app, test::TestRequest::post().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/v1/runs")
                .set_json(serde_json::json!({ "scraperId": "missing" }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn test_execute_then_query() {
        let manager = manager();
        let program = Program::new(vec![ScraperInstruction::Marker { name: "start".into() }]).unwrap();
        let saved = manager.storage().save_scraper("noop", &program).await.unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(manager.clone()))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/api/v1/runs")
                .set_json(serde_json::json!({ "scraperId": saved.id }))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: serde_json::Value = test::read_body_json(resp).await;
        let run_id = Uuid::parse_str(body["runId"].as_str().unwrap()).unwrap();

        assert!(manager.wait(run_id).await.unwrap().is_success());

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(&format!("/api/v1/runs/{}", run_id)).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["record"]["status"], "succeeded");
        assert_eq!(body["state"]["status"], "Exited");
    }
}
