use crate::{
    Result,
    app::query_api::{
        Query,
        QueryAPI,
    },
    views::{
        CurrentGameDto,
        ErrorDto,
        GameDetailDto,
        GameDto,
        LeaderboardEntryDto,
        PendingSetDto,
        StatusDto,
        UserStatsDto,
        parse_address,
    },
};
use actix_cors::Cors;
use actix_web::{
    App,
    HttpResponse,
    HttpServer,
    dev::ServerHandle,
    error::{
        ErrorBadRequest,
        ErrorInternalServerError,
    },
    web,
};
use anyhow::{
    Context,
    anyhow,
};
use serde::Deserialize;
use std::{
    net::TcpListener,
    thread::JoinHandle,
};
use tokio::sync::{
    mpsc,
    oneshot,
};

pub const DEFAULT_QUERY_PORT: u16 = 42069;

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

pub struct ActixQueryApi {
    receiver: mpsc::Receiver<Query>,
    base_url: String,
    server_handle: ServerHandle,
    server_thread: Option<JoinHandle<()>>,
}

impl ActixQueryApi {
    pub async fn new(port: Option<u16>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(16);

        let listener = TcpListener::bind(("127.0.0.1", port.unwrap_or(0)))
            .context("failed to bind HTTP listener for query API")?;
        let address = listener
            .local_addr()
            .context("failed to read listener address")?;
        let base_url = format!("http://{}", address);

        tracing::info!("query API listening on {}", base_url);

        let server = HttpServer::new(move || {
            App::new()
                .wrap(Cors::permissive())
                .app_data(web::Data::new(sender.clone()))
                .route("/api/games", web::get().to(handle_history))
                .route("/api/games/{id}", web::get().to(handle_game_detail))
                .route("/api/users/{address}", web::get().to(handle_user_stats))
                .route("/api/leaderboard", web::get().to(handle_leaderboard))
                .route("/api/current-game", web::get().to(handle_current_game))
                .route("/api/pending", web::get().to(handle_pending))
                .route("/api/status", web::get().to(handle_status))
        })
        .listen(listener)
        .context("failed to start Actix server")?
        .run();

        let server_handle = server.handle();
        let server_thread = std::thread::spawn(move || {
            let sys = actix_web::rt::System::new();
            let _ = sys.block_on(server);
        });

        Ok(Self {
            receiver,
            base_url,
            server_handle,
            server_thread: Some(server_thread),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl QueryAPI for ActixQueryApi {
    async fn query(&mut self) -> Result<Query> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| anyhow!("query server closed"))
    }
}

impl Drop for ActixQueryApi {
    fn drop(&mut self) {
        let _ = self.server_handle.stop(true);
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

async fn ask<T>(
    sender: &mpsc::Sender<Query>,
    query: impl FnOnce(oneshot::Sender<T>) -> Query,
) -> actix_web::Result<T> {
    let (response_sender, response_receiver) = oneshot::channel();
    sender
        .send(query(response_sender))
        .await
        .map_err(|_| ErrorInternalServerError("unable to forward query"))?;
    response_receiver
        .await
        .map_err(|_| ErrorInternalServerError("query responder dropped"))
}

fn not_found(message: &str) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorDto {
        error: message.to_string(),
    })
}

async fn handle_history(
    sender: web::Data<mpsc::Sender<Query>>,
    params: web::Query<LimitParams>,
) -> actix_web::Result<web::Json<Vec<GameDto>>> {
    let limit = params.limit;
    let games = ask(sender.get_ref(), |sender| Query::History { limit, sender }).await?;
    Ok(web::Json(games))
}

async fn handle_game_detail(
    sender: web::Data<mpsc::Sender<Query>>,
    game_id: web::Path<String>,
) -> actix_web::Result<HttpResponse> {
    let Ok(game_id) = game_id.parse::<u64>() else {
        return Ok(not_found("Game not found"));
    };
    let detail: Option<GameDetailDto> =
        ask(sender.get_ref(), |sender| Query::GameDetail { game_id, sender }).await?;
    Ok(match detail {
        Some(detail) => HttpResponse::Ok().json(detail),
        None => not_found("Game not found"),
    })
}

async fn handle_user_stats(
    sender: web::Data<mpsc::Sender<Query>>,
    address: web::Path<String>,
) -> actix_web::Result<web::Json<UserStatsDto>> {
    let player = parse_address(&address).map_err(ErrorBadRequest)?;
    let stats = ask(sender.get_ref(), |sender| Query::UserStats { player, sender }).await?;
    Ok(web::Json(stats))
}

async fn handle_leaderboard(
    sender: web::Data<mpsc::Sender<Query>>,
    params: web::Query<LimitParams>,
) -> actix_web::Result<web::Json<Vec<LeaderboardEntryDto>>> {
    let limit = params.limit;
    let entries =
        ask(sender.get_ref(), |sender| Query::Leaderboard { limit, sender }).await?;
    Ok(web::Json(entries))
}

async fn handle_current_game(
    sender: web::Data<mpsc::Sender<Query>>,
) -> actix_web::Result<HttpResponse> {
    let current: Option<CurrentGameDto> = ask(sender.get_ref(), Query::CurrentGame).await?;
    Ok(match current {
        Some(current) => HttpResponse::Ok().json(current),
        None => not_found("No active game"),
    })
}

async fn handle_pending(
    sender: web::Data<mpsc::Sender<Query>>,
) -> actix_web::Result<web::Json<PendingSetDto>> {
    Ok(web::Json(ask(sender.get_ref(), Query::PendingSet).await?))
}

async fn handle_status(
    sender: web::Data<mpsc::Sender<Query>>,
) -> actix_web::Result<web::Json<StatusDto>> {
    Ok(web::Json(ask(sender.get_ref(), Query::Status).await?))
}
