use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

mod auth;
mod bank;
mod config;
mod error;
mod game;
mod rates;
mod store;
mod withdrawals;

use crate::bank::SqlBank;
use crate::config::{load_config, AppConfig};
use crate::error::GameError;
use crate::game::{ClientHandle, Game};
use crate::rates::{save_rates, start_rates_task, RatesService};
use crate::store::SqlStore;
use crate::withdrawals::WithdrawalSigner;

#[derive(Clone)]
struct AppState {
    cfg: Arc<AppConfig>,
    game: Arc<Game>,
    signer: Arc<WithdrawalSigner>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_file = std::env::args().nth(1).unwrap_or_else(|| "crash.yaml".to_string());
    let cfg = Arc::new(load_config(&config_file)?);

    init_tracing(&cfg);
    info!(
        config = %config_file,
        project = %cfg.logging.project_id,
        log = %cfg.logging.log_id,
        "crash running"
    );

    let db = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await
        .context("connect postgres")?;

    let rates_service = RatesService::new(cfg.rates.clone());
    let prices = rates_service.fetch_rates().await.context("initial rates fetch")?;
    save_rates(&db, &prices).await.context("save initial rates")?;
    start_rates_task(db.clone(), rates_service, cfg.timers.rates_check_frequency_mins);

    let bank = Arc::new(SqlBank::new(db.clone()));
    let store = Arc::new(SqlStore::new(db.clone()));

    for (id, def) in &cfg.currencies {
        info!(
            currency = %id,
            name = %def.name,
            units = %def.units,
            coin_id = def.coin_id,
            decimals = def.decimals,
            "currency configured"
        );
    }

    let signer = Arc::new(WithdrawalSigner::from_env(bank.clone(), db.clone(), cfg.clone())?);
    info!(
        agent = %signer.address(),
        chain_id = cfg.on_chain.chain_id,
        rpc = %cfg.on_chain.rpc_url,
        contract = %cfg.on_chain.contract,
        "withdrawal signer ready"
    );

    let game = Game::new(bank, store);

    let cors = CorsLayer::new()
        .allow_origin(
            cfg.cors
                .origin
                .parse::<HeaderValue>()
                .context("cors.origin is not a valid header value")?,
        )
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true);

    let state = AppState { cfg: cfg.clone(), game, signer };

    let app = Router::new()
        .route("/nonce", get(nonce_handler))
        .route("/socket", get(ws_handler))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.listen)
        .await
        .with_context(|| format!("bind {}", cfg.server.listen))?;
    info!(listen = %cfg.server.listen, "serving");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(cfg: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cfg.logging.local_only {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}

async fn nonce_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "nonce": auth::make_nonce() }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Inbound frames are `{event, data, ack?}`; replies go out as `{ack, data}`
/// when an ack id was supplied, `{event, data}` otherwise.
#[derive(Debug, serde::Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    ack: Option<u64>,
}

struct Session {
    wallet: Option<String>,
}

/// Marker: the peer violated the protocol and the connection must be torn
/// down.
struct Disconnect;

async fn handle_socket(state: AppState, socket: WebSocket) {
    let client_id = Uuid::new_v4();
    let (client, mut outbox) = ClientHandle::channel(client_id);
    let (mut sink, mut stream) = socket.split();

    // The engine emits under its lock; this task drains the channel so the
    // fan-out never blocks on the peer.
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbox.recv().await {
            let Ok(text) = serde_json::to_string(&payload) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    info!(client = %client_id, "client connected");
    state.game.handle_connect(client.clone()).await;

    let mut session = Session { wallet: None };

    while let Some(message) = stream.next().await {
        let Ok(message) = message else {
            break;
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<Envelope>(&text) else {
            warn!(client = %client_id, "malformed frame");
            break;
        };
        if let Err(Disconnect) = dispatch(&state, &client, &mut session, &envelope).await {
            break;
        }
    }

    info!(client = %client_id, "client disconnected");
    state.game.handle_disconnect(client_id).await;
    writer.abort();
}

async fn dispatch(
    state: &AppState,
    client: &ClientHandle,
    session: &mut Session,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    match envelope.event.as_str() {
        "authenticate" => authenticate_handler(state, client, envelope),
        "login" => login_handler(state, client, session, envelope).await,
        "refreshToken" => refresh_token_handler(state, client, session, envelope),
        "placeBet" => place_bet_handler(state, client, session, envelope).await,
        "cancelBet" => cancel_bet_handler(state, client, session, envelope).await,
        "cashOut" => cash_out_handler(state, session).await,
        "withdraw" => withdraw_handler(state, client, session, envelope).await,
        "disconnected" => Err(Disconnect),
        other => {
            warn!(client = %client.id(), event = other, "unhandled event");
            Ok(())
        }
    }
}

fn reply(client: &ClientHandle, event: &str, ack: Option<u64>, data: serde_json::Value) {
    match ack {
        Some(id) => client.ack(id, data),
        None => client.emit(event, data),
    }
}

fn ack_result(result: Result<(), GameError>) -> serde_json::Value {
    match result {
        Ok(()) => serde_json::json!({ "success": true }),
        Err(e) => serde_json::json!({ "success": false, "errorCode": e.code() }),
    }
}

fn authenticate_handler(
    state: &AppState,
    client: &ClientHandle,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    info!(client = %client.id(), "client authenticating");

    let (Some(message), Some(signature)) = (
        envelope.data.get("message").and_then(|v| v.as_str()),
        envelope.data.get("signature").and_then(|v| v.as_str()),
    ) else {
        warn!(client = %client.id(), "invalid parameters");
        return Err(Disconnect);
    };

    let wallet = match auth::verify_eip191(message, signature) {
        Ok(wallet) => wallet,
        Err(e) => {
            warn!(client = %client.id(), error = %e, "invalid signature");
            reply(client, "authenticate", envelope.ack, serde_json::json!({ "success": false }));
            return Ok(());
        }
    };

    match auth::generate_token(&state.cfg.auth.jwt_secret, &wallet) {
        Ok(token) => {
            info!(client = %client.id(), "authentication successful");
            reply(
                client,
                "authenticate",
                envelope.ack,
                serde_json::json!({ "token": token, "success": true }),
            );
        }
        Err(e) => {
            error!(error = %e, "error generating token");
            reply(client, "authenticate", envelope.ack, serde_json::json!({ "success": false }));
        }
    }

    Ok(())
}

async fn login_handler(
    state: &AppState,
    client: &ClientHandle,
    session: &mut Session,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    info!(client = %client.id(), "client logging in");

    let Some(token) = envelope.data.get("token").and_then(|v| v.as_str()) else {
        warn!(client = %client.id(), "invalid parameters");
        return Err(Disconnect);
    };

    let wallet = match auth::validate_token(&state.cfg.auth.jwt_secret, token) {
        Ok(wallet) => wallet,
        Err(_) => {
            warn!(client = %client.id(), "invalid session");
            return Err(Disconnect);
        }
    };

    session.wallet = Some(wallet.clone());
    state.game.handle_login(client.id(), &wallet).await;

    info!(wallet = %wallet, "user logged in");
    reply(client, "login", envelope.ack, serde_json::json!({ "success": true }));

    Ok(())
}

fn refresh_token_handler(
    state: &AppState,
    client: &ClientHandle,
    session: &Session,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    let Some(wallet) = session.wallet.as_deref() else {
        return Err(Disconnect);
    };

    info!(wallet = %wallet, "refreshing JWT token");

    match auth::generate_token(&state.cfg.auth.jwt_secret, wallet) {
        Ok(token) => reply(
            client,
            "refreshToken",
            envelope.ack,
            serde_json::json!({ "token": token, "success": true }),
        ),
        Err(e) => {
            error!(error = %e, "error generating token");
            reply(client, "refreshToken", envelope.ack, serde_json::json!({ "success": false }));
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
struct PlaceBetParams {
    bet_amount: Decimal,
    auto_cash_out: Decimal,
    currency: String,
}

fn parse_place_bet_params(cfg: &AppConfig, data: &serde_json::Value) -> Option<PlaceBetParams> {
    let bet_amount = data.get("betAmount")?.as_str()?;
    let auto_cash_out = data.get("autoCashOut")?.as_str()?;
    let currency = data.get("currency")?.as_str()?;

    let bet_amount = Decimal::from_str(bet_amount).ok()?;
    let auto_cash_out = Decimal::from_str(auto_cash_out).ok()?;

    if bet_amount <= Decimal::ZERO || auto_cash_out < Decimal::ZERO {
        return None;
    }
    if !cfg.currencies.contains_key(currency) {
        return None;
    }

    Some(PlaceBetParams {
        bet_amount,
        auto_cash_out,
        currency: currency.to_string(),
    })
}

#[derive(Debug, PartialEq)]
struct WithdrawParams {
    amount: Decimal,
    currency: String,
}

fn parse_withdraw_params(cfg: &AppConfig, data: &serde_json::Value) -> Option<WithdrawParams> {
    let amount = data.get("amount")?.as_str()?;
    let currency = data.get("currency")?.as_str()?;

    let amount = Decimal::from_str(amount).ok()?;
    if amount <= Decimal::ZERO {
        return None;
    }
    if !cfg.currencies.contains_key(currency) {
        return None;
    }

    Some(WithdrawParams { amount, currency: currency.to_string() })
}

async fn place_bet_handler(
    state: &AppState,
    client: &ClientHandle,
    session: &Session,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    let Some(wallet) = session.wallet.clone() else {
        warn!(client = %client.id(), "placeBet before login");
        return Err(Disconnect);
    };

    info!(wallet = %wallet, "placeBet for user");

    let Some(params) = parse_place_bet_params(&state.cfg, &envelope.data) else {
        warn!(client = %client.id(), "invalid parameters");
        return Err(Disconnect);
    };

    let result = state
        .game
        .handle_place_bet(client, &wallet, &params.currency, params.bet_amount, params.auto_cash_out)
        .await;

    reply(client, "placeBet", envelope.ack, ack_result(result));

    Ok(())
}

async fn cancel_bet_handler(
    state: &AppState,
    client: &ClientHandle,
    session: &Session,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    let Some(wallet) = session.wallet.clone() else {
        warn!(client = %client.id(), "cancelBet before login");
        return Err(Disconnect);
    };

    info!(wallet = %wallet, "cancelBet for user");

    let result = state.game.handle_cancel_bet(&wallet).await;
    reply(client, "cancelBet", envelope.ack, ack_result(result));

    Ok(())
}

async fn cash_out_handler(state: &AppState, session: &Session) -> Result<(), Disconnect> {
    let Some(wallet) = session.wallet.clone() else {
        return Err(Disconnect);
    };

    info!(wallet = %wallet, "cashOut for user");

    if let Err(e) = state.game.handle_cash_out(&wallet).await {
        warn!(wallet = %wallet, error = %e, "cash-out rejected");
    }

    Ok(())
}

async fn withdraw_handler(
    state: &AppState,
    client: &ClientHandle,
    session: &Session,
    envelope: &Envelope,
) -> Result<(), Disconnect> {
    let Some(wallet) = session.wallet.clone() else {
        warn!(client = %client.id(), "withdraw before login");
        return Err(Disconnect);
    };

    let Some(params) = parse_withdraw_params(&state.cfg, &envelope.data) else {
        warn!(client = %client.id(), "invalid parameters");
        return Err(Disconnect);
    };

    info!(wallet = %wallet, amount = %params.amount, currency = %params.currency, "withdraw for user");

    match state.signer.withdraw(&wallet, &params.currency, params.amount).await {
        Ok(signed) => reply(
            client,
            "withdraw",
            envelope.ack,
            serde_json::json!({
                "success": true,
                "nonce": signed.nonce,
                "signature": signed.signature,
                "balance": signed.balance.to_string(),
                "request": serde_json::to_value(&signed.request).unwrap_or(serde_json::Value::Null),
            }),
        ),
        Err(e) => {
            warn!(wallet = %wallet, error = %e, "withdrawal failed");
            reply(
                client,
                "withdraw",
                envelope.ack,
                serde_json::json!({ "success": false, "errorCode": e.code() }),
            );
        }
    }

    Ok(())
}
