// HTTP request handlers for API endpoints

use crate::api::models::*;
use crate::util::db::Db;
use crate::database_ops::search::{self as queries, SearchFilters};
use actix_web::{web, HttpRequest, HttpResponse, Result};
use std::time::Instant;

/// Process start, for `/health` uptime.
#[derive(Debug, Clone, Copy)]
pub struct StartedAt(pub Instant);

fn internal_error(what: &str, e: anyhow::Error) -> HttpResponse {
    tracing::error!(error = %format!("{e:#}"), "{what} failed");
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(format!("{what} failed")))
}

/// Health check endpoint
pub async fn health_check(db: web::Data<Db>, started: web::Data<StartedAt>) -> Result<HttpResponse> {
    let connected = sqlx::query_scalar::<_, bool>("SELECT true")
        .fetch_one(&db.pool)
        .await
        .is_ok();

    let response = ApiResponse::success(HealthResponse {
        status: if connected { "healthy" } else { "degraded" }.to_string(),
        database: if connected { "connected" } else { "disconnected" }.to_string(),
        uptime_seconds: started.0.elapsed().as_secs(),
    });

    if connected {
        Ok(HttpResponse::Ok().json(response))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(response))
    }
}

/// `GET /api/v1/search`
pub async fn search(req: HttpRequest, db: web::Data<Db>) -> Result<HttpResponse> {
    let filters = match SearchFilters::from_query(req.query_string()) {
        Ok(f) => f,
        Err(e) => return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string()))),
    };
    tracing::debug!(?filters, "search requested");

    match queries::search_games(&db, &filters).await {
        Ok(games) => Ok(HttpResponse::Ok().json(ApiResponse::success(SearchResponse {
            count: games.len(),
            limit: filters.limit,
            offset: filters.offset,
            games,
        }))),
        Err(e) => Ok(internal_error("search", e)),
    }
}

/// `GET /api/v1/games/{steam_id}`
pub async fn get_game(path: web::Path<i64>, db: web::Data<Db>) -> Result<HttpResponse> {
    let steam_id = path.into_inner();
    match queries::get_game(&db, steam_id).await {
        Ok(Some(game)) => Ok(HttpResponse::Ok().json(ApiResponse::success(game))),
        Ok(None) => Ok(HttpResponse::NotFound()
            .json(ApiResponse::<()>::error(format!("game {steam_id} not found")))),
        Err(e) => Ok(internal_error("game lookup", e)),
    }
}

/// `GET /api/v1/prices/{steam_id}`
pub async fn get_prices(path: web::Path<i64>, db: web::Data<Db>) -> Result<HttpResponse> {
    let steam_id = path.into_inner();
    match queries::get_prices(&db, steam_id).await {
        Ok(Some(prices)) => Ok(HttpResponse::Ok().json(ApiResponse::success(PriceHistoryResponse {
            steam_id,
            prices,
        }))),
        Ok(None) => Ok(HttpResponse::NotFound()
            .json(ApiResponse::<()>::error(format!("game {steam_id} not found")))),
        Err(e) => Ok(internal_error("price history", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::configure_routes;
    use actix_web::{http::StatusCode, test, App};
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    // Nothing listens on port 1; every query fails fast.
    fn unreachable_db() -> Db {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(300))
            .connect_lazy("postgresql://nobody@127.0.0.1:1/steam")
            .unwrap();
        Db { pool }
    }

    #[actix_web::test]
    async fn bad_sort_key_is_a_client_error() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(unreachable_db()))
                .configure(configure_routes),
        )
        .await;
        let req = test::TestRequest::get()
            .uri("/api/v1/search?sort=game_id")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("game_id"));
    }

    #[actix_web::test]
    async fn health_reports_unreachable_database() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(unreachable_db()))
                .app_data(web::Data::new(StartedAt(Instant::now())))
                .configure(configure_routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["database"], "disconnected");
    }

    #[actix_web::test]
    async fn database_failure_is_a_server_error() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(unreachable_db()))
                .configure(configure_routes),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/games/620").to_request()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
