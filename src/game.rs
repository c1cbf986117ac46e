use std::collections::HashMap;
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bank::Bank;
use crate::error::GameError;
use crate::store::{GameStore, RoundRecord};

pub(crate) const WAIT_TIME_SECS: i64 = 5;
const WAIT_TIME: Duration = Duration::from_secs(WAIT_TIME_SECS as u64);
const RECENT_GAMES_LIMIT: i64 = 10;

/// Per-millisecond exponent of the payout law: multiplier(t) = exp(GROWTH_COEFF * t_ms).
const GROWTH_COEFF: f64 = 6e-5;

const EVENT_GAME_WAITING: &str = "GameWaiting";
const EVENT_GAME_RUNNING: &str = "GameRunning";
const EVENT_GAME_CRASHED: &str = "GameCrashed";
const EVENT_PLAYER_WON: &str = "PlayerWon";
const EVENT_PLAYER_LOST: &str = "PlayerLost";
const EVENT_BET_LIST: &str = "BetList";
const EVENT_UPDATE_BALANCE: &str = "UpdateBalance";
const EVENT_INIT_BALANCES: &str = "InitBalances";
const EVENT_RECENT_GAMES: &str = "RecentGameList";

/// Non-blocking handle to one connected client. The engine emits through the
/// channel while holding its lock; the transport side drains it.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl ClientHandle {
    pub(crate) fn channel(id: Uuid) -> (Self, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn emit(&self, event: &str, data: serde_json::Value) {
        // A closed channel just means the client is gone.
        let _ = self.tx.send(serde_json::json!({ "event": event, "data": data }));
    }

    pub(crate) fn ack(&self, id: u64, data: serde_json::Value) {
        let _ = self.tx.send(serde_json::json!({ "ack": id, "data": data }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GameState {
    Stopped,
    Waiting,
    Running,
    Crashed,
}

#[derive(Debug, Clone)]
pub(crate) struct CashOut {
    pub(crate) abs_time: DateTime<Utc>,
    pub(crate) duration_ms: i64,
    pub(crate) multiplier: Decimal,
    pub(crate) payout: Decimal,
    pub(crate) auto: bool,
}

pub(crate) struct Player {
    wallet: String,
    currency: String,
    bet_amount: Decimal,
    auto_cash_out: Decimal,
    client_id: Uuid,
    cash_out: Option<CashOut>,
    timer: Option<JoinHandle<()>>,
}

impl Player {
    fn to_json(&self) -> serde_json::Value {
        let cashed_multiplier = self
            .cash_out
            .as_ref()
            .map(|c| c.multiplier)
            .unwrap_or(Decimal::ZERO);
        serde_json::json!({
            "wallet": self.wallet,
            "currency": self.currency,
            "betAmount": self.bet_amount.to_string(),
            "autoCashOut": format!("{:.2}", self.auto_cash_out),
            "cashOut": format!("{:.2}", cashed_multiplier),
            "isCashedOut": self.cash_out.is_some(),
        })
    }
}

struct Observer {
    wallet: Option<String>,
    client: ClientHandle,
}

/// The committed outcome of one round, derived from the seed before any
/// player can act on it.
#[derive(Debug, Clone)]
pub(crate) struct RoundPlan {
    pub(crate) seed: String,
    pub(crate) hash: String,
    pub(crate) multiplier: Decimal,
    pub(crate) duration_ms: i64,
}

pub(crate) fn generate_seed() -> String {
    let mut buffer = [0u8; 48];
    OsRng.fill_bytes(&mut buffer);
    let mut seed = URL_SAFE_NO_PAD.encode(buffer);
    seed.truncate(64);
    seed
}

pub(crate) fn game_hash(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hex::encode(hasher.finalize())
}

/// First 13 hex digits of the hash are a 52-bit integer h; the crash point is
/// floor(98 * 2^52 / (2^52 - h)) / 100, clamped to at least 1.00.
pub(crate) fn hash_to_multiplier(hash: &str) -> Decimal {
    let h = u64::from_str_radix(&hash[0..13], 16).unwrap_or(0);
    let e = 2f64.powi(52);
    let r = ((98.0 * e) / (e - h as f64)).floor();
    let m = r.round() / 100.0;

    if m < 1.0 {
        return Decimal::ONE;
    }

    Decimal::from_f64(m)
        .unwrap_or(Decimal::ONE)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Inverts the payout law; truncates to whole milliseconds.
pub(crate) fn multiplier_to_duration_ms(multiplier: Decimal) -> i64 {
    let m = multiplier.to_f64().unwrap_or(1.0);
    if m <= 1.0 {
        return 0;
    }
    (m.ln() / GROWTH_COEFF) as i64
}

pub(crate) fn generate_round() -> RoundPlan {
    let seed = generate_seed();
    let hash = game_hash(&seed);
    let multiplier = hash_to_multiplier(&hash);
    let duration_ms = multiplier_to_duration_ms(multiplier);
    RoundPlan { seed, hash, multiplier, duration_ms }
}

pub(crate) fn multiplier_at(elapsed_ms: i64) -> Decimal {
    let m = (GROWTH_COEFF * elapsed_ms as f64).exp();
    Decimal::from_f64(m)
        .unwrap_or(Decimal::ONE)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub(crate) fn calculate_payout(elapsed_ms: i64, bet_amount: Decimal) -> (Decimal, Decimal) {
    let multiplier = multiplier_at(elapsed_ms);
    (bet_amount * multiplier, multiplier)
}

struct Round {
    id: Uuid,
    hash: String,
    state: GameState,
    // Bumped whenever a new round is created; scheduled callbacks carry the
    // epoch they were armed for and no-op on mismatch.
    epoch: u64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    start_instant: Instant,
    duration_ms: i64,
    players: Vec<Player>,
    waiting: Vec<Player>,
    observers: HashMap<Uuid, Observer>,
}

impl Round {
    fn stopped() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            hash: String::new(),
            state: GameState::Stopped,
            epoch: 0,
            start_time: now,
            end_time: now,
            start_instant: Instant::now(),
            duration_ms: 0,
            players: Vec::new(),
            waiting: Vec::new(),
            observers: HashMap::new(),
        }
    }
}

pub(crate) struct Game {
    bank: Arc<dyn Bank>,
    store: Arc<dyn GameStore>,
    plans: Box<dyn Fn() -> RoundPlan + Send + Sync>,
    round: Mutex<Round>,
    // Handle to our own Arc so timer callbacks can re-enter the engine.
    this: Weak<Game>,
}

impl Game {
    pub(crate) fn new(bank: Arc<dyn Bank>, store: Arc<dyn GameStore>) -> Arc<Self> {
        Self::with_round_source(bank, store, Box::new(generate_round))
    }

    pub(crate) fn with_round_source(
        bank: Arc<dyn Bank>,
        store: Arc<dyn GameStore>,
        plans: Box<dyn Fn() -> RoundPlan + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bank,
            store,
            plans,
            round: Mutex::new(Round::stopped()),
            this: this.clone(),
        })
    }

    pub(crate) async fn handle_connect(&self, client: ClientHandle) {
        let mut round = self.round.lock().await;

        if round.observers.contains_key(&client.id()) {
            return;
        }

        round.observers.insert(
            client.id(),
            Observer { wallet: None, client: client.clone() },
        );

        match self.store.recent_rounds(RECENT_GAMES_LIMIT).await {
            Ok(games) => {
                let games: Vec<serde_json::Value> = games.iter().map(RoundRecord::to_json).collect();
                client.emit(EVENT_RECENT_GAMES, serde_json::json!({ "games": games }));
            }
            Err(e) => error!(error = %e, "error fetching recent games"),
        }

        match round.state {
            GameState::Stopped => {
                info!("entering game wait state");
                self.create_round(&mut round);
            }
            GameState::Waiting => {
                client.emit(
                    EVENT_GAME_WAITING,
                    serde_json::json!({ "startTime": round.start_time.timestamp_millis() }),
                );
            }
            _ => {}
        }
    }

    pub(crate) async fn handle_login(&self, client_id: Uuid, wallet: &str) {
        let mut round = self.round.lock().await;

        let Some(observer) = round.observers.get_mut(&client_id) else {
            return;
        };

        observer.wallet = Some(wallet.to_string());
        let client = observer.client.clone();

        match self.bank.balances(wallet).await {
            Ok(balances) => {
                client.emit(EVENT_INIT_BALANCES, serde_json::json!({ "balances": balances }));
            }
            Err(e) => warn!(wallet, error = %e, "failed to load balances"),
        }
    }

    pub(crate) async fn handle_disconnect(&self, client_id: Uuid) {
        let mut round = self.round.lock().await;
        if let Some(observer) = round.observers.remove(&client_id) {
            if let Some(wallet) = observer.wallet {
                info!(client = %client_id, wallet = %wallet, "observer left");
            }
        }
    }

    pub(crate) async fn handle_place_bet(
        &self,
        client: &ClientHandle,
        wallet: &str,
        currency: &str,
        bet_amount: Decimal,
        auto_cash_out: Decimal,
    ) -> Result<(), GameError> {
        let mut round = self.round.lock().await;

        if round.state != GameState::Waiting {
            return Err(GameError::WrongState);
        }

        if round.waiting.iter().any(|p| p.wallet == wallet) {
            warn!(game = %round.id, wallet, "player already joined waitlist");
            return Err(GameError::AlreadyJoined);
        }

        let balance = match self.bank.balance(wallet, currency).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(wallet, error = %e, "failed to get user balance");
                return Err(GameError::InsufficientFunds);
            }
        };

        if balance < bet_amount {
            warn!(
                wallet,
                bet_amount = %bet_amount,
                balance = %balance,
                currency,
                "insufficient balance for operation"
            );
            return Err(GameError::InsufficientFunds);
        }

        round.waiting.push(Player {
            wallet: wallet.to_string(),
            currency: currency.to_string(),
            bet_amount,
            auto_cash_out,
            client_id: client.id(),
            cash_out: None,
            timer: None,
        });

        self.emit_bet_list(&round);

        Ok(())
    }

    pub(crate) async fn handle_cancel_bet(&self, wallet: &str) -> Result<(), GameError> {
        let mut round = self.round.lock().await;

        let Some(index) = round.waiting.iter().position(|p| p.wallet == wallet) else {
            return Err(GameError::NotWaiting);
        };

        round.waiting.remove(index);

        self.emit_bet_list(&round);

        Ok(())
    }

    pub(crate) async fn handle_cash_out(&self, wallet: &str) -> Result<(), GameError> {
        self.cash_out(wallet, false).await
    }

    async fn cash_out(&self, wallet: &str, auto: bool) -> Result<(), GameError> {
        let mut round = self.round.lock().await;

        if round.state != GameState::Running {
            return Err(GameError::WrongState);
        }

        let Some(index) = round.players.iter().position(|p| p.wallet == wallet) else {
            return Err(GameError::NotPlaying);
        };

        if round.players[index].cash_out.is_some() {
            return Err(GameError::AlreadyCashedOut);
        }

        let elapsed_ms = round.start_instant.elapsed().as_millis() as i64;
        let (payout, multiplier) = calculate_payout(elapsed_ms, round.players[index].bet_amount);

        let record = CashOut {
            abs_time: Utc::now(),
            duration_ms: elapsed_ms,
            multiplier,
            payout,
            auto,
        };

        let game_id = round.id;
        let player = &mut round.players[index];
        let wallet = player.wallet.clone();
        let currency = player.currency.clone();
        let client_id = player.client_id;

        info!(
            game = %game_id,
            wallet = %wallet,
            payout = %record.payout,
            currency = %currency,
            multiplier = %record.multiplier,
            duration_ms = record.duration_ms,
            at = %record.abs_time,
            auto = record.auto,
            "player cashed out"
        );

        player.cash_out = Some(record);

        let reason = if auto { "Auto cashout" } else { "Cashout" };

        // The cash-out stands even when the credit fails; the discrepancy is
        // left to the journal and the logs.
        match self.bank.credit(&wallet, &currency, payout, reason, game_id).await {
            Ok(balance) => self.emit_balance_update(&round, client_id, &currency, balance),
            Err(e) => error!(
                game = %game_id,
                wallet = %wallet,
                payout = %payout,
                currency = %currency,
                error = %e,
                "failed to credit win"
            ),
        }

        self.broadcast(
            &round,
            EVENT_PLAYER_WON,
            serde_json::json!({ "wallet": wallet, "multiplier": multiplier }),
        );

        Ok(())
    }

    fn create_round(&self, round: &mut Round) {
        let plan = (self.plans)();

        round.id = Uuid::now_v7();
        round.epoch += 1;
        round.state = GameState::Waiting;
        round.hash = plan.hash;
        round.start_time = Utc::now() + ChronoDuration::seconds(WAIT_TIME_SECS);
        round.start_instant = Instant::now() + WAIT_TIME;
        round.duration_ms = plan.duration_ms;
        round.end_time = round.start_time + ChronoDuration::milliseconds(plan.duration_ms);
        round.players.clear();
        round.waiting.clear();

        info!(
            game = %round.id,
            start_time = %round.start_time,
            end_time = %round.end_time,
            "created new game"
        );
        tracing::debug!(
            game = %round.id,
            seed = %plan.seed,
            hash = %round.hash,
            multiplier = %plan.multiplier,
            "committed round outcome"
        );

        if let Some(game) = self.this.upgrade() {
            let epoch = round.epoch;
            tokio::spawn(async move {
                sleep(WAIT_TIME).await;
                game.handle_round_start(epoch).await;
            });
        }

        self.broadcast(
            round,
            EVENT_GAME_WAITING,
            serde_json::json!({ "startTime": round.start_time.timestamp_millis() }),
        );
    }

    async fn handle_round_start(&self, epoch: u64) {
        let mut round = self.round.lock().await;

        if round.epoch != epoch || round.state != GameState::Waiting {
            return;
        }

        info!(game = %round.id, "preparing to start game");

        if round.waiting.is_empty() && round.observers.is_empty() {
            info!(game = %round.id, "no observers; not starting");
            round.state = GameState::Stopped;
            return;
        }

        info!(game = %round.id, duration_ms = round.duration_ms, "starting game");

        round.state = GameState::Running;

        self.commit_waiting(&mut round).await;

        for player in round.players.iter_mut() {
            if player.auto_cash_out == Decimal::ZERO {
                continue;
            }
            let Some(game) = self.this.upgrade() else {
                break;
            };
            let target = player.auto_cash_out.to_f64().unwrap_or(1.0);
            let delay_ms = (target.ln() / GROWTH_COEFF).max(0.0) as u64;
            let wallet = player.wallet.clone();
            player.timer = Some(tokio::spawn(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                info!(wallet = %wallet, "auto cashing out");
                let _ = game.cash_out(&wallet, true).await;
            }));
        }

        if let Some(game) = self.this.upgrade() {
            let epoch = round.epoch;
            let duration = Duration::from_millis(round.duration_ms.max(0) as u64);
            tokio::spawn(async move {
                sleep(duration).await;
                game.handle_crash(epoch).await;
            });
        }

        self.broadcast(
            &round,
            EVENT_GAME_RUNNING,
            serde_json::json!({ "startTime": round.start_time.timestamp_millis() }),
        );
    }

    /// Debits every waiting bet in order; a failed debit drops the player
    /// without aborting the round.
    async fn commit_waiting(&self, round: &mut Round) {
        let waiting = std::mem::take(&mut round.waiting);
        round.players.clear();

        for player in waiting {
            match self
                .bank
                .debit(
                    &player.wallet,
                    &player.currency,
                    player.bet_amount,
                    "Bet placed",
                    round.id,
                )
                .await
            {
                Ok(balance) => {
                    self.emit_balance_update(round, player.client_id, &player.currency, balance);
                    round.players.push(player);
                }
                Err(e) => {
                    warn!(
                        game = %round.id,
                        wallet = %player.wallet,
                        error = %e,
                        "unable to take balance for user; removing from game"
                    );
                }
            }
        }

        self.emit_bet_list(round);
    }

    async fn handle_crash(&self, epoch: u64) {
        let mut round = self.round.lock().await;

        if round.epoch != epoch || round.state != GameState::Running {
            return;
        }

        info!(game = %round.id, "crashing game");

        round.state = GameState::Crashed;

        for player in &round.players {
            self.broadcast(
                &round,
                EVENT_PLAYER_LOST,
                serde_json::json!({ "wallet": player.wallet }),
            );
        }

        let record = self.build_record(&round);

        if let Err(e) = self.store.save_round(&record).await {
            // The round still completes; only the history row is lost.
            error!(game = %round.id, error = %e, "error saving game record");
        }

        self.clear_timers(&mut round);

        info!(game = %round.id, "entering game wait state");

        self.broadcast(
            &round,
            EVENT_GAME_CRASHED,
            serde_json::json!({ "game": record.to_json() }),
        );

        if let Some(game) = self.this.upgrade() {
            let epoch = round.epoch;
            tokio::spawn(async move {
                sleep(WAIT_TIME).await;
                game.handle_next_round(epoch).await;
            });
        }
    }

    async fn handle_next_round(&self, epoch: u64) {
        let mut round = self.round.lock().await;

        if round.epoch != epoch || round.state != GameState::Crashed {
            return;
        }

        if round.observers.is_empty() {
            info!("no observers; stopping");
            round.state = GameState::Stopped;
            return;
        }

        info!("entering game wait state");
        self.create_round(&mut round);
    }

    fn build_record(&self, round: &Round) -> RoundRecord {
        let winners = round.players.iter().filter(|p| p.cash_out.is_some()).count() as i32;

        RoundRecord {
            id: round.id,
            start_time: round.start_time,
            duration_ms: round.duration_ms,
            multiplier: multiplier_at(round.duration_ms),
            players: round.players.len() as i32,
            winners,
        }
    }

    fn clear_timers(&self, round: &mut Round) {
        for player in round.players.iter_mut() {
            if let Some(timer) = player.timer.take() {
                timer.abort();
            }
        }
    }

    fn emit_balance_update(&self, round: &Round, client_id: Uuid, currency: &str, balance: Decimal) {
        if let Some(observer) = round.observers.get(&client_id) {
            observer.client.emit(
                EVENT_UPDATE_BALANCE,
                serde_json::json!({ "currency": currency, "balance": balance.to_string() }),
            );
        }
    }

    fn emit_bet_list(&self, round: &Round) {
        let players: Vec<serde_json::Value> = round.players.iter().map(Player::to_json).collect();
        let waiting: Vec<serde_json::Value> = round.waiting.iter().map(Player::to_json).collect();
        self.broadcast(
            round,
            EVENT_BET_LIST,
            serde_json::json!({ "players": players, "waiting": waiting }),
        );
    }

    fn broadcast(&self, round: &Round, event: &str, data: serde_json::Value) {
        for observer in round.observers.values() {
            observer.client.emit(event, data.clone());
        }
    }

    #[cfg(test)]
    pub(crate) async fn state(&self) -> GameState {
        self.round.lock().await.state
    }

    #[cfg(test)]
    pub(crate) async fn committed_hash(&self) -> String {
        self.round.lock().await.hash.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::bank::ensure_positive;
    use crate::error::BankError;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    struct MockBank {
        accounts: StdMutex<HashMap<(String, String), Decimal>>,
    }

    impl MockBank {
        fn with_account(wallet: &str, currency: &str, balance: &str) -> Arc<Self> {
            let mut accounts = HashMap::new();
            accounts.insert((wallet.to_string(), currency.to_string()), dec(balance));
            Arc::new(Self { accounts: StdMutex::new(accounts) })
        }

        fn balance_of(&self, wallet: &str, currency: &str) -> Decimal {
            *self
                .accounts
                .lock()
                .unwrap()
                .get(&(wallet.to_string(), currency.to_string()))
                .unwrap()
        }
    }

    #[async_trait]
    impl Bank for MockBank {
        async fn credit(
            &self,
            wallet: &str,
            currency: &str,
            amount: Decimal,
            _reason: &str,
            _game_id: Uuid,
        ) -> Result<Decimal, BankError> {
            ensure_positive(amount)?;
            let mut accounts = self.accounts.lock().unwrap();
            let Some(balance) = accounts.get_mut(&(wallet.to_string(), currency.to_string())) else {
                return Err(BankError::AccountMissing);
            };
            *balance += amount;
            Ok(*balance)
        }

        async fn debit(
            &self,
            wallet: &str,
            currency: &str,
            amount: Decimal,
            _reason: &str,
            _game_id: Uuid,
        ) -> Result<Decimal, BankError> {
            ensure_positive(amount)?;
            let mut accounts = self.accounts.lock().unwrap();
            let Some(balance) = accounts.get_mut(&(wallet.to_string(), currency.to_string())) else {
                return Err(BankError::AccountMissing);
            };
            if *balance < amount {
                return Err(BankError::InsufficientFunds);
            }
            *balance -= amount;
            Ok(*balance)
        }

        async fn balance(&self, wallet: &str, currency: &str) -> Result<Decimal, BankError> {
            self.accounts
                .lock()
                .unwrap()
                .get(&(wallet.to_string(), currency.to_string()))
                .copied()
                .ok_or(BankError::AccountMissing)
        }

        async fn balances(&self, wallet: &str) -> Result<HashMap<String, Decimal>, BankError> {
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .filter(|((w, _), _)| w == wallet)
                .map(|((_, c), b)| (c.clone(), *b))
                .collect())
        }
    }

    #[derive(Default)]
    struct MemStore {
        rounds: StdMutex<Vec<RoundRecord>>,
    }

    impl MemStore {
        fn saved(&self) -> Vec<RoundRecord> {
            self.rounds.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GameStore for MemStore {
        async fn save_round(&self, record: &RoundRecord) -> anyhow::Result<()> {
            self.rounds.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn recent_rounds(&self, limit: i64) -> anyhow::Result<Vec<RoundRecord>> {
            let rounds = self.rounds.lock().unwrap();
            Ok(rounds.iter().rev().take(limit as usize).cloned().collect())
        }
    }

    fn fixed_rounds(multiplier: &str, duration_ms: i64) -> Box<dyn Fn() -> RoundPlan + Send + Sync> {
        let multiplier = dec(multiplier);
        Box::new(move || RoundPlan {
            seed: "fixed".to_string(),
            hash: game_hash("fixed"),
            multiplier,
            duration_ms,
        })
    }

    fn events_named(received: &[serde_json::Value], name: &str) -> Vec<serde_json::Value> {
        received
            .iter()
            .filter(|v| v["event"] == name)
            .map(|v| v["data"].clone())
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(v) = rx.try_recv() {
            out.push(v);
        }
        out
    }

    #[test]
    fn hash_calculations_match_committed_vector() {
        let hash = game_hash("cats_are_everywhere");
        assert_eq!(
            hash,
            "a39a59caa7ea909dc72685681062a1bfd650f155ac6018677b0f4de5a0d8430b"
        );

        let multiplier = hash_to_multiplier(&hash);
        assert_eq!(multiplier, dec("2.71"));

        assert_eq!(multiplier_to_duration_ms(multiplier), 16_615);
    }

    #[test]
    fn generated_multipliers_are_well_formed() {
        for _ in 0..64 {
            let plan = generate_round();
            assert_eq!(plan.seed.len(), 64);
            assert_eq!(plan.hash.len(), 64);
            assert!(plan.multiplier >= Decimal::ONE);
            assert!(plan.multiplier.scale() <= 2);

            // The duration must invert the payout law to within a millisecond.
            let m = plan.multiplier.to_f64().unwrap();
            let exact = m.ln() / 6e-5;
            assert!((plan.duration_ms as f64 - exact).abs() <= 1.0);
        }
    }

    #[test]
    fn multiplier_at_zero_is_one() {
        assert_eq!(multiplier_at(0), dec("1.00"));
        let (payout, multiplier) = calculate_payout(0, dec("3.50"));
        assert_eq!(multiplier, dec("1.00"));
        assert_eq!(payout, dec("3.50"));
    }

    #[test]
    fn multiplier_at_ten_seconds() {
        // e^0.6 = 1.8221...
        assert_eq!(multiplier_at(10_000), dec("1.82"));
    }

    #[test]
    fn multiplier_is_monotonic_in_elapsed_time() {
        let mut last = Decimal::ZERO;
        for ms in (0..60_000).step_by(500) {
            let m = multiplier_at(ms);
            assert!(m >= last);
            last = m;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bet_and_win_pays_at_the_observed_multiplier() {
        let bank = MockBank::with_account("0xabc", "eth", "100.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank.clone(), store.clone(), fixed_rounds("3.32", 20_000));

        let (client, mut rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;
        game.handle_login(client.id(), "0xabc").await;
        assert_eq!(game.state().await, GameState::Waiting);
        assert!(!game.committed_hash().await.is_empty());

        game.handle_place_bet(&client, "0xabc", "eth", dec("0.10"), Decimal::ZERO)
            .await
            .unwrap();

        // Past the waiting window; round is running and the bet is committed.
        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(game.state().await, GameState::Running);
        assert_eq!(bank.balance_of("0xabc", "eth"), dec("99.90"));

        // Cash out at exactly 10s into the round: e^0.6 = 1.82.
        sleep(Duration::from_millis(9_999)).await;
        game.handle_cash_out("0xabc").await.unwrap();
        assert_eq!(bank.balance_of("0xabc", "eth"), dec("100.082"));

        // Second cash-out is rejected.
        assert_eq!(
            game.handle_cash_out("0xabc").await,
            Err(GameError::AlreadyCashedOut)
        );

        // Let the crash fire.
        sleep(Duration::from_millis(10_001)).await;
        assert_eq!(game.state().await, GameState::Crashed);

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].players, 1);
        assert_eq!(saved[0].winners, 1);
        assert_eq!(saved[0].multiplier, dec("3.32"));
        assert_eq!(saved[0].duration_ms, 20_000);

        let received = drain(&mut rx);
        let won = events_named(&received, "PlayerWon");
        assert_eq!(won.len(), 1);
        assert_eq!(won[0]["wallet"], "0xabc");
        assert_eq!(won[0]["multiplier"], "1.82");
        assert_eq!(events_named(&received, "GameRunning").len(), 1);
        assert_eq!(events_named(&received, "GameCrashed").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bet_and_lose_forfeits_the_stake() {
        let bank = MockBank::with_account("0xdef", "eth", "50.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank.clone(), store.clone(), fixed_rounds("2.00", 11_552));

        let (client, mut rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;
        game.handle_login(client.id(), "0xdef").await;
        game.handle_place_bet(&client, "0xdef", "eth", dec("5.00"), Decimal::ZERO)
            .await
            .unwrap();

        sleep(Duration::from_millis(5_001 + 11_552)).await;
        assert_eq!(game.state().await, GameState::Crashed);
        assert_eq!(bank.balance_of("0xdef", "eth"), dec("45.00"));

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].players, 1);
        assert_eq!(saved[0].winners, 0);

        let received = drain(&mut rx);
        let lost = events_named(&received, "PlayerLost");
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0]["wallet"], "0xdef");
        assert!(events_named(&received, "PlayerWon").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observerless_round_returns_to_stopped() {
        let bank = MockBank::with_account("0xabc", "eth", "1.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank, store.clone(), fixed_rounds("2.00", 11_552));

        let (client, _rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;
        assert_eq!(game.state().await, GameState::Waiting);

        game.handle_disconnect(client.id()).await;

        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(game.state().await, GameState::Stopped);
        assert!(store.saved().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_crash_when_observers_left() {
        let bank = MockBank::with_account("0xabc", "eth", "10.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank, store.clone(), fixed_rounds("2.00", 11_552));

        let (client, _rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;
        game.handle_login(client.id(), "0xabc").await;
        game.handle_place_bet(&client, "0xabc", "eth", dec("1.00"), Decimal::ZERO)
            .await
            .unwrap();

        sleep(Duration::from_millis(5_001 + 11_552)).await;
        assert_eq!(game.state().await, GameState::Crashed);

        // Everyone leaves during the post-crash wait.
        game.handle_disconnect(client.id()).await;
        sleep(Duration::from_millis(5_001)).await;
        assert_eq!(game.state().await, GameState::Stopped);

        // One round was still persisted.
        assert_eq!(store.saved().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_cashout_fires_at_the_requested_multiplier() {
        let bank = MockBank::with_account("0xabc", "eth", "100.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank.clone(), store.clone(), fixed_rounds("3.32", 20_000));

        let (client, mut rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;
        game.handle_login(client.id(), "0xabc").await;
        game.handle_place_bet(&client, "0xabc", "eth", dec("1.00"), dec("2.0"))
            .await
            .unwrap();

        // ln(2) / 6e-5 = 11552ms; run past it but short of the crash.
        sleep(Duration::from_millis(5_001 + 12_000)).await;

        let received = drain(&mut rx);
        let won = events_named(&received, "PlayerWon");
        assert_eq!(won.len(), 1);
        assert_eq!(won[0]["multiplier"], "2.00");
        assert_eq!(bank.balance_of("0xabc", "eth"), dec("101.00"));

        sleep(Duration::from_millis(20_000)).await;
        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_errors_are_reported() {
        let bank = MockBank::with_account("0xabc", "eth", "10.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank, store, fixed_rounds("2.00", 11_552));

        let (client, _rx) = ClientHandle::channel(Uuid::new_v4());

        // No round yet: betting and cashing out are both out of state.
        assert_eq!(
            game.handle_place_bet(&client, "0xabc", "eth", dec("1.00"), Decimal::ZERO)
                .await,
            Err(GameError::WrongState)
        );
        assert_eq!(game.handle_cash_out("0xabc").await, Err(GameError::WrongState));

        game.handle_connect(client.clone()).await;
        game.handle_place_bet(&client, "0xabc", "eth", dec("1.00"), Decimal::ZERO)
            .await
            .unwrap();

        // Double join is rejected; an unknown wallet cannot cancel.
        assert_eq!(
            game.handle_place_bet(&client, "0xabc", "eth", dec("1.00"), Decimal::ZERO)
                .await,
            Err(GameError::AlreadyJoined)
        );
        assert_eq!(
            game.handle_cancel_bet("0xother").await,
            Err(GameError::NotWaiting)
        );

        // Cancel removes the waiting bet; cancelling again fails.
        game.handle_cancel_bet("0xabc").await.unwrap();
        assert_eq!(
            game.handle_cancel_bet("0xabc").await,
            Err(GameError::NotWaiting)
        );

        // Cashing out while merely waiting is out of state.
        assert_eq!(game.handle_cash_out("0xabc").await, Err(GameError::WrongState));
    }

    #[tokio::test(start_paused = true)]
    async fn bet_above_balance_is_rejected() {
        let bank = MockBank::with_account("0xabc", "eth", "0.50");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank, store, fixed_rounds("2.00", 11_552));

        let (client, _rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;

        assert_eq!(
            game.handle_place_bet(&client, "0xabc", "eth", dec("1.00"), Decimal::ZERO)
                .await,
            Err(GameError::InsufficientFunds)
        );
        assert_eq!(
            game.handle_place_bet(&client, "0xnobody", "eth", dec("1.00"), Decimal::ZERO)
                .await,
            Err(GameError::InsufficientFunds)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn underfunded_player_is_dropped_at_commit() {
        // Two bets race one balance: the first commit debit wins, the second
        // is dropped without aborting the round.
        let bank = MockBank::with_account("0xa", "eth", "1.00");
        {
            let mut accounts = bank.accounts.lock().unwrap();
            accounts.insert(("0xb".to_string(), "eth".to_string()), dec("1.00"));
        }
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank.clone(), store.clone(), fixed_rounds("2.00", 11_552));

        let (client_a, _rx_a) = ClientHandle::channel(Uuid::new_v4());
        let (client_b, _rx_b) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client_a.clone()).await;
        game.handle_connect(client_b.clone()).await;
        game.handle_place_bet(&client_a, "0xa", "eth", dec("1.00"), Decimal::ZERO)
            .await
            .unwrap();
        game.handle_place_bet(&client_b, "0xb", "eth", dec("1.00"), Decimal::ZERO)
            .await
            .unwrap();

        // Drain b's funds between the bet and the commit.
        bank.debit("0xb", "eth", dec("0.75"), "Bet placed", Uuid::nil())
            .await
            .unwrap();

        sleep(Duration::from_millis(5_001 + 11_553)).await;

        let saved = store.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].players, 1);
        assert_eq!(bank.balance_of("0xa", "eth"), dec("0.00"));
        assert_eq!(bank.balance_of("0xb", "eth"), dec("0.25"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_sends_recent_round_history() {
        let bank = MockBank::with_account("0xabc", "eth", "1.00");
        let store = Arc::new(MemStore::default());
        store
            .save_round(&RoundRecord {
                id: Uuid::now_v7(),
                start_time: Utc::now(),
                duration_ms: 16_615,
                multiplier: dec("2.71"),
                players: 2,
                winners: 1,
            })
            .await
            .unwrap();

        let game = Game::with_round_source(bank, store, fixed_rounds("2.00", 11_552));
        let (client, mut rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;

        let received = drain(&mut rx);
        let recents = events_named(&received, "RecentGameList");
        assert_eq!(recents.len(), 1);
        let games = recents[0]["games"].as_array().unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0]["multiplier"], "2.71");
        assert_eq!(games[0]["winners"], 1);

        // The fresh round also announced itself.
        assert_eq!(events_named(&received, "GameWaiting").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn login_pushes_initial_balances() {
        let bank = MockBank::with_account("0xabc", "eth", "403.00");
        let store = Arc::new(MemStore::default());
        let game = Game::with_round_source(bank, store, fixed_rounds("2.00", 11_552));

        let (client, mut rx) = ClientHandle::channel(Uuid::new_v4());
        game.handle_connect(client.clone()).await;
        game.handle_login(client.id(), "0xabc").await;

        let received = drain(&mut rx);
        let init = events_named(&received, "InitBalances");
        assert_eq!(init.len(), 1);
        assert_eq!(init[0]["balances"]["eth"], "403.00");
    }

    #[tokio::test(start_paused = true)]
    async fn credit_then_debit_is_balance_neutral() {
        let bank = MockBank::with_account("0xabc", "eth", "10.00");
        let amount = dec("3.33");
        bank.credit("0xabc", "eth", amount, "Credit", Uuid::nil()).await.unwrap();
        bank.debit("0xabc", "eth", amount, "Debit", Uuid::nil()).await.unwrap();
        assert_eq!(bank.balance_of("0xabc", "eth"), dec("10.00"));

        // Exactly the available balance drains to zero; a step further fails.
        bank.debit("0xabc", "eth", dec("10.00"), "Debit", Uuid::nil()).await.unwrap();
        assert!(matches!(
            bank.debit("0xabc", "eth", dec("0.01"), "Debit", Uuid::nil()).await,
            Err(BankError::InsufficientFunds)
        ));
    }
}
