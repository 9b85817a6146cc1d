use axum::{
    extract::{ws::{Message, WebSocket}, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use noise::{NoiseFn, Perlin};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{mpsc, RwLock};
use tower_http::services::ServeDir;
use tracing::{info, warn};
use uuid::Uuid;

const TICK_MS: u64 = 33;
const TILE_SIZE: f32 = 40.0;
const CHUNK_SIZE: i32 = 16;
const MAX_ENEMIES: usize = 225;
const ENEMY_SPAWN_INTERVAL: f32 = 1.0;
const DESPAWN_RADIUS: f32 = 2500.0;
const DESPAWN_TIME: f32 = 60.0;
const REGEN_DELAY: f32 = 15.0;
const INVENTORY_SLOTS: usize = 12;
const INTERACT_RADIUS: f32 = 80.0;
const PICKUP_RADIUS: f32 = 100.0;
const TELEPORT_CHARGE_TIME: f32 = 5.0;
const TELEPORT_COOLDOWN: f32 = 600.0;
const PLAYER_RADIUS: f32 = 14.0;
const MELEE_COOLDOWN: f32 = 0.8;
const MELEE_RADIUS: f32 = 60.0;
const MELEE_KNOCKBACK: f32 = 15.0;
const BOOST_SPEED_FACTOR: f32 = 1.8;
const BOOST_ENERGY_DRAIN: f32 = 35.0;
const BOSS_RESPAWN_DELAY: f32 = 300.0;
const BOSS_XP_REWARD: i64 = 5000;
const THREAT_HEALTH_STEP: f32 = 0.6;
const THREAT_DAMAGE_STEP: f32 = 0.4;
const DEATH_CREDIT_FRACTION: f32 = 0.8;
const LOOT_BAG_PICKUP_DELAY: f32 = 3.0;
const ADMIN_USERNAME: &str = "overseer";

const BIOME_NOISE_SEED: u32 = 0x5EED_0B10;
const STRUCTURE_NOISE_SEED: u32 = 0x5EED_57AC;

const TILE_VOID: u8 = 0;
const TILE_FLOOR: u8 = 1;
const TILE_FUNGAL_WALL: u8 = 2;
const TILE_CRYSTAL_WALL: u8 = 3;
const TILE_CITY_FLOOR: u8 = 10;
const TILE_CITY_WALL: u8 = 11;
const TILE_ARENA_WALL: u8 = 12;
const TILE_ARENA_FLOOR: u8 = 13;
const TILE_DOOR: u8 = 15;

const CITY_SPAWN: (f32, f32) = (8.0 * TILE_SIZE, 8.0 * TILE_SIZE);

// Hand-authored origin chunk. Rows below the layout fall back to city floor.
const CITY_LAYOUT: [[u8; 16]; 12] = [
    [11, 11, 11, 11, 11, 11, 11, 15, 15, 11, 11, 11, 11, 11, 11, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [15, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 15],
    [15, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 15],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 10, 11],
    [11, 11, 11, 11, 11, 11, 11, 15, 15, 11, 11, 11, 11, 11, 11, 11],
];

const ARENA_WALL_INNER: f32 = 9.0;
const ARENA_WALL_OUTER: f32 = 10.5;

const BOSS_SITES: [(EnemyKind, f32, f32); 4] = [
    (EnemyKind::Colossus, 150.0 * TILE_SIZE, 150.0 * TILE_SIZE),
    (EnemyKind::LeviathanHead, -150.0 * TILE_SIZE, -150.0 * TILE_SIZE),
    (EnemyKind::Augur, 0.5 * TILE_SIZE, 300.0 * TILE_SIZE),
    (EnemyKind::Stalker, 300.0 * TILE_SIZE, 0.0),
];

fn is_solid(tile: u8) -> bool {
    matches!(
        tile,
        TILE_FUNGAL_WALL | TILE_CRYSTAL_WALL | TILE_CITY_WALL | TILE_ARENA_WALL
    )
}

fn tier_color(tier: u8) -> &'static str {
    match tier {
        1 => "#9ea3a1",
        2 => "#ffffff",
        3 => "#32a852",
        4 => "#3273a8",
        5 => "#a832a4",
        _ => "#e3d400",
    }
}

#[derive(Clone)]
struct AppState {
    state: Arc<RwLock<GameState>>,
    store: GameStore,
}

type AppResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = GameStore::new("data");
    let banks: HashMap<String, Vec<BankStack>> = store.load_blob("banks.json").await;
    let market: MarketData = store.load_blob("market.json").await;

    let mut game = GameState::new(banks, market);
    initialize_world(&mut game);
    let state = Arc::new(RwLock::new(game));

    let app_state = AppState { state, store };

    spawn_game_loop(app_state.clone());

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .nest_service("/", ServeDir::new("public").append_index_html_on_directories(true))
        .with_state(app_state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_handler(State(app_state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let sid = Uuid::new_v4().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, sid))
}

async fn handle_socket(socket: WebSocket, app_state: AppState, sid: String) {
    let (mut socket_sender, mut socket_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    info!("connection {} opened", sid);

    {
        let mut state = app_state.state.write().await;
        state.clients.insert(sid.clone(), tx);

        let chunks = state
            .world
            .chunks
            .iter()
            .map(|(coord, chunk)| ChunkPayload {
                chunk_x: coord.x,
                chunk_y: coord.y,
                tiles: chunk.tiles.clone(),
            })
            .collect();
        send_to(
            &state,
            &sid,
            ServerMessage::Init { player_id: sid.clone(), chunks },
        );
        send_system_to(&state, &sid, "Connection established. Welcome to Voidfront.");
        for (kind, x, y) in BOSS_SITES {
            let hint = format!(
                "{} signature detected near [{}, {}].",
                kind.display_name(),
                (x / TILE_SIZE).round() as i32,
                (y / TILE_SIZE).round() as i32
            );
            send_system_to(&state, &sid, &hint);
        }
    }

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let payload = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(err) => {
                    warn!("serialize message failed: {}", err);
                    continue;
                }
            };
            if socket_sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = socket_receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => handle_client_message(&app_state, &sid, client_msg).await,
                Err(err) => warn!("malformed message from {}: {}", sid, err),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    {
        let mut state = app_state.state.write().await;
        let trading_name = state
            .players
            .get(&sid)
            .filter(|player| player.trade.partner_id.is_some())
            .map(|player| player.username.clone());
        if let Some(name) = trading_name {
            cancel_trade(&mut state, &sid, &format!("{} has disconnected.", name));
        }
        state.clients.remove(&sid);
        if let Some(player) = state.players.remove(&sid) {
            info!("player {} ({}) disconnected", player.username, sid);
        } else {
            info!("connection {} closed", sid);
        }
    }

    send_task.abort();
}

async fn handle_client_message(app_state: &AppState, sid: &str, msg: ClientMessage) {
    let mut state = app_state.state.write().await;
    match msg {
        ClientMessage::Join { class, username, color } => {
            handle_join(&mut state, sid, class, username, color);
        }
        ClientMessage::Input { inputs, angle } => {
            if let Some(player) = state.players.get_mut(sid) {
                if !player.is_dead {
                    player.inputs = inputs;
                    player.angle = angle;
                }
            }
        }
        ClientMessage::Chat { text } => {
            let trimmed: String = text.trim().chars().take(160).collect();
            if trimmed.is_empty() {
                return;
            }
            let (sender, color) = match state.players.get(sid) {
                Some(player) if !player.is_dead => {
                    (player.username.clone(), player.color.clone())
                }
                _ => return,
            };
            broadcast(&state, ServerMessage::Chat { sender, text: trimmed, color });
        }
        ClientMessage::TradeRequest { target_id } => {
            trade_request(&mut state, sid, &target_id);
        }
        ClientMessage::TradeResponse { requester_id, accepted } => {
            if accepted {
                start_trade(&mut state, sid, &requester_id);
            }
        }
        ClientMessage::TradeOffer { item_ids, credits } => {
            trade_offer(&mut state, sid, item_ids, credits);
        }
        ClientMessage::TradeAcceptStage1 => {
            trade_accept_stage1(&mut state, sid);
        }
        ClientMessage::TradeAcceptStage2 => {
            trade_accept_stage2(&mut state, sid);
        }
        ClientMessage::TradeCancel => {
            let name = match state.players.get(sid) {
                Some(player) => player.username.clone(),
                None => return,
            };
            cancel_trade(&mut state, sid, &format!("{} cancelled the trade.", name));
        }
        // Everything that touches the per-tick collections waits for the next
        // tick boundary.
        other => {
            state.queued_commands.push((sid.to_string(), other));
        }
    }
}

fn handle_join(
    state: &mut GameState,
    sid: &str,
    class: PlayerClass,
    username: String,
    color: String,
) {
    if state.players.contains_key(sid) {
        return;
    }
    let username: String = username.trim().chars().take(20).collect();
    if username.is_empty() {
        return;
    }
    let mut player = Player::new(sid.to_string(), username.clone(), color, class);
    if let Some(payout) = state.market.payouts.remove(&username) {
        if payout > 0 {
            player.credits += payout;
            state.market_dirty = true;
            send_system_to(state, sid, &format!("Market sales paid out {} credits.", payout));
        }
    }
    info!("player {} joined as {:?}", username, class);
    state.players.insert(sid.to_string(), player);
}

fn broadcast(state: &GameState, msg: ServerMessage) {
    for tx in state.clients.values() {
        let _ = tx.send(msg.clone());
    }
}

fn send_to(state: &GameState, sid: &str, msg: ServerMessage) {
    if let Some(tx) = state.clients.get(sid) {
        let _ = tx.send(msg);
    }
}

fn send_system_to(state: &GameState, sid: &str, text: &str) {
    send_to(
        state,
        sid,
        ServerMessage::Chat {
            sender: "SYSTEM".to_string(),
            text: text.to_string(),
            color: "#00ffcc".to_string(),
        },
    );
}

fn system_broadcast(state: &GameState, text: &str) {
    broadcast(
        state,
        ServerMessage::Chat {
            sender: "SYSTEM".to_string(),
            text: text.to_string(),
            color: "#00ffcc".to_string(),
        },
    );
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn distance(ax: f32, ay: f32, bx: f32, by: f32) -> f32 {
    ((bx - ax).powi(2) + (by - ay).powi(2)).sqrt()
}

fn initialize_world(state: &mut GameState) {
    state.world.ensure_chunk(ChunkCoord { x: 0, y: 0 });
    state.world.pending_broadcasts.clear();

    let stations = [
        (StationKind::Exchange, "Exchange", 2.5, 2.5),
        (StationKind::Bank, "Vault Terminal", 13.5, 2.5),
        (StationKind::Medbay, "Medbay", 2.5, 9.5),
        (StationKind::Console, "Ops Console", 13.5, 9.5),
        (StationKind::Portal, "Dormant Portal", 8.0, 3.5),
    ];
    for (station, name, tx, ty) in stations {
        let id = state.next_id();
        state.entities.push(Entity {
            id,
            x: tx * TILE_SIZE,
            y: ty * TILE_SIZE,
            radius: 14.0,
            life: f32::INFINITY,
            color: "#00ffcc".to_string(),
            source: None,
            is_dead: false,
            kind: EntityKind::Station { station, name: name.to_string() },
        });
    }

    for (kind, x, y) in BOSS_SITES {
        spawn_boss(state, kind, x, y);
    }
}

fn spawn_game_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
        loop {
            ticker.tick().await;
            game_tick(&app_state).await;
        }
    });
}

async fn game_tick(app_state: &AppState) {
    let dt = TICK_MS as f32 / 1000.0;
    let (banks_save, market_save) = {
        let mut guard = app_state.state.write().await;
        let state = &mut *guard;
        run_tick(state, dt);

        let banks_save = if state.banks_dirty {
            state.banks_dirty = false;
            Some(state.banks.clone())
        } else {
            None
        };
        let market_save = if state.market_dirty {
            state.market_dirty = false;
            Some(state.market.clone())
        } else {
            None
        };
        (banks_save, market_save)
    };

    if let Some(banks) = banks_save {
        let store = app_state.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save_blob("banks.json", &banks).await {
                warn!("bank save failed: {}", err);
            }
        });
    }
    if let Some(market) = market_save {
        let store = app_state.store.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save_blob("market.json", &market).await {
                warn!("market save failed: {}", err);
            }
        });
    }
}

fn run_tick(state: &mut GameState, dt: f32) {
    let queued = std::mem::take(&mut state.queued_commands);
    for (sid, command) in queued {
        apply_command(state, &sid, command);
    }

    ensure_player_chunks(state);
    update_players(state, dt);
    update_enemies(state, dt);
    update_entities(state, dt);
    run_deferred(state, dt);
    resolve_collisions(state, dt);
    collect_credit_drops(state);
    update_lifecycle(state, dt);

    state.entities.retain(|entity| !entity.is_dead);
    state.enemies.retain(|_, enemy| !enemy.is_dead);

    for coord in std::mem::take(&mut state.world.pending_broadcasts) {
        if let Some(chunk) = state.world.chunks.get(&coord) {
            broadcast(
                state,
                ServerMessage::ChunkData {
                    chunk_x: coord.x,
                    chunk_y: coord.y,
                    tiles: chunk.tiles.clone(),
                },
            );
        }
    }

    broadcast_snapshot(state);
}

fn ensure_player_chunks(state: &mut GameState) {
    let mut needed = HashSet::new();
    for player in state.players.values() {
        let center = ChunkCoord::containing(player.x, player.y);
        for dy in -1..=1 {
            for dx in -1..=1 {
                needed.insert(ChunkCoord { x: center.x + dx, y: center.y + dy });
            }
        }
    }
    for coord in needed {
        state.world.ensure_chunk(coord);
    }
}

fn broadcast_snapshot(state: &GameState) {
    let players: HashMap<String, PlayerPublic> = state
        .players
        .iter()
        .map(|(id, player)| (id.clone(), PlayerPublic::from(player)))
        .collect();
    let enemies: Vec<EnemyPublic> = state
        .enemies
        .values()
        .filter(|enemy| enemy.kind != EnemyKind::LeviathanSegment)
        .map(|enemy| enemy_snapshot(enemy, &state.enemies))
        .collect();
    let entities: Vec<EntityPublic> = state
        .entities
        .iter()
        .filter(|entity| !entity.is_dead)
        .map(EntityPublic::from)
        .collect();
    broadcast(state, ServerMessage::Update { players, enemies, entities });
}

fn apply_command(state: &mut GameState, sid: &str, command: ClientMessage) {
    match command {
        ClientMessage::Respawn => {
            if let Some(player) = state.players.get_mut(sid) {
                if player.is_dead {
                    player.respawn();
                }
            }
        }
        ClientMessage::PickupLoot { entity_id, item_index } => {
            pickup_loot(state, sid, entity_id, item_index);
        }
        ClientMessage::EquipItem { slot_index } => {
            if let Some(player) = state.players.get_mut(sid) {
                if player.is_dead || slot_index >= player.inventory.len() {
                    return;
                }
                if let Some(item) = player.inventory[slot_index].take() {
                    let slot = item.slot;
                    let previous = player.equipment.slot_mut(slot).replace(item);
                    player.inventory[slot_index] = previous;
                    player.recalculate_stats();
                }
            }
        }
        ClientMessage::UnequipItem { slot } => {
            if let Some(player) = state.players.get_mut(sid) {
                if player.is_dead {
                    return;
                }
                if let Some(item) = player.equipment.slot_mut(slot).take() {
                    if let Some(unplaced) = add_to_inventory(player, item) {
                        // no room, keep it equipped
                        *player.equipment.slot_mut(slot) = Some(unplaced);
                    } else {
                        player.recalculate_stats();
                    }
                }
            }
        }
        ClientMessage::DropItem { slot_index } => {
            let mut dropped = None;
            if let Some(player) = state.players.get_mut(sid) {
                if !player.is_dead {
                    if let Some(slot) = player.inventory.get_mut(slot_index) {
                        if let Some(item) = slot.take() {
                            dropped = Some((item, player.x, player.y));
                        }
                    }
                }
            }
            if let Some((item, x, y)) = dropped {
                spawn_equipment_drop(state, x, y, item, 0.5);
            }
        }
        ClientMessage::DropEquipped { slot } => {
            let mut dropped = None;
            if let Some(player) = state.players.get_mut(sid) {
                if !player.is_dead {
                    if let Some(item) = player.equipment.slot_mut(slot).take() {
                        player.recalculate_stats();
                        dropped = Some((item, player.x, player.y));
                    }
                }
            }
            if let Some((item, x, y)) = dropped {
                spawn_equipment_drop(state, x, y, item, 0.5);
            }
        }
        ClientMessage::BuyShopItem { entry_index } => {
            buy_shop_item(state, sid, entry_index);
        }
        ClientMessage::SellItem { slot_index } => {
            if let Some(player) = state.players.get_mut(sid) {
                if player.is_dead {
                    return;
                }
                if let Some(slot) = player.inventory.get_mut(slot_index) {
                    if let Some(item) = slot.take() {
                        player.credits += item_base_value(item.tier) / 3;
                    }
                }
            }
        }
        ClientMessage::BankAction { action, index, amount } => {
            bank_action(state, sid, action, index, amount);
        }
        ClientMessage::MarketList { slot_index, price } => {
            market_list(state, sid, slot_index, price);
        }
        ClientMessage::MarketBuy { listing_id } => {
            market_buy(state, sid, listing_id);
        }
        _ => {}
    }
}

fn pickup_loot(state: &mut GameState, sid: &str, entity_id: u64, item_index: Option<usize>) {
    let mut player = match state.players.remove(sid) {
        Some(player) => player,
        None => return,
    };
    if !player.is_dead {
        for entity in state.entities.iter_mut() {
            if entity.id != entity_id || entity.is_dead {
                continue;
            }
            if distance(player.x, player.y, entity.x, entity.y) > PICKUP_RADIUS {
                break;
            }
            match &mut entity.kind {
                EntityKind::LootBag { items, credits, pickup_delay } => {
                    if *pickup_delay > 0.0 {
                        break;
                    }
                    match item_index {
                        None => {
                            player.credits += *credits;
                            *credits = 0;
                        }
                        Some(index) => {
                            if let Some(slot) = items.get_mut(index) {
                                if let Some(item) = slot.take() {
                                    if let Some(unplaced) = add_to_inventory(&mut player, item) {
                                        *slot = Some(unplaced);
                                    }
                                }
                            }
                        }
                    }
                    if *credits <= 0 && items.iter().all(|slot| slot.is_none()) {
                        entity.is_dead = true;
                    }
                }
                EntityKind::EquipmentDrop { item, pickup_delay } => {
                    if *pickup_delay > 0.0 {
                        break;
                    }
                    if add_to_inventory(&mut player, item.clone()).is_none() {
                        entity.is_dead = true;
                    }
                }
                _ => {}
            }
            break;
        }
    }
    state.players.insert(sid.to_string(), player);
}

fn buy_shop_item(state: &mut GameState, sid: &str, entry_index: usize) {
    let entry = match state.shop.get(entry_index) {
        Some(entry) => entry.clone(),
        None => return,
    };
    let bought = if let Some(player) = state.players.get_mut(sid) {
        if player.is_dead || player.credits < entry.cost {
            false
        } else {
            let mut item = entry.item.clone();
            item.id = new_item_id();
            if add_to_inventory(player, item).is_none() {
                player.credits -= entry.cost;
                true
            } else {
                false
            }
        }
    } else {
        false
    };
    if bought {
        send_system_to(state, sid, &format!("Purchased {}.", entry.item.name));
    }
}

fn bank_action(state: &mut GameState, sid: &str, action: BankOp, index: usize, amount: BankAmount) {
    let stacks = {
        let player = match state.players.get_mut(sid) {
            Some(player) if !player.is_dead => player,
            _ => return,
        };
        let bank = state.banks.entry(player.username.clone()).or_default();
        match action {
            BankOp::Deposit => {
                let sample = match player.inventory.get(index).and_then(|slot| slot.clone()) {
                    Some(item) => item,
                    None => return,
                };
                let matching: Vec<usize> = player
                    .inventory
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| {
                        slot.as_ref().map(|item| item.same_kind(&sample)).unwrap_or(false)
                    })
                    .map(|(i, _)| i)
                    .collect();
                let requested = match amount {
                    BankAmount::All => matching.len() as u32,
                    BankAmount::Count(n) => n,
                };
                let count = requested.min(matching.len() as u32) as usize;
                if count == 0 {
                    return;
                }
                for &slot_index in matching.iter().take(count) {
                    player.inventory[slot_index] = None;
                }
                if let Some(stack) = bank.iter_mut().find(|stack| stack.item.same_kind(&sample)) {
                    stack.quantity += count as u32;
                } else {
                    bank.push(BankStack { item: sample, quantity: count as u32 });
                }
            }
            BankOp::Withdraw => {
                let available = match bank.get(index) {
                    Some(stack) => stack.quantity,
                    None => return,
                };
                let requested = match amount {
                    BankAmount::All => available,
                    BankAmount::Count(n) => n,
                };
                let free = free_slots(player) as u32;
                let count = requested.min(available).min(free);
                if count == 0 {
                    return;
                }
                for _ in 0..count {
                    let mut item = bank[index].item.clone();
                    item.id = new_item_id();
                    if add_to_inventory(player, item).is_some() {
                        break;
                    }
                }
                bank[index].quantity -= count;
                if bank[index].quantity == 0 {
                    bank.remove(index);
                }
            }
        }
        bank.clone()
    };
    state.banks_dirty = true;
    send_to(state, sid, ServerMessage::OpenBank { stacks });
}

fn market_list(state: &mut GameState, sid: &str, slot_index: usize, price: i64) {
    let price = price.clamp(1, 1_000_000);
    let listed = {
        let player = match state.players.get_mut(sid) {
            Some(player) if !player.is_dead => player,
            _ => return,
        };
        let item = match player.inventory.get_mut(slot_index).and_then(|slot| slot.take()) {
            Some(item) => item,
            None => return,
        };
        let seller = player.username.clone();
        let id = state.market.next_listing_id;
        state.market.next_listing_id += 1;
        let name = item.name.clone();
        state.market.listings.push(MarketListing { id, seller, item, price });
        name
    };
    state.market_dirty = true;
    send_system_to(state, sid, &format!("Listed {} for {} credits.", listed, price));
}

fn market_buy(state: &mut GameState, sid: &str, listing_id: u64) {
    let position = match state
        .market
        .listings
        .iter()
        .position(|listing| listing.id == listing_id)
    {
        Some(position) => position,
        None => return,
    };
    let affordable = match state.players.get_mut(sid) {
        Some(player) if !player.is_dead => {
            player.credits >= state.market.listings[position].price && free_slots(player) > 0
        }
        _ => return,
    };
    if !affordable {
        send_system_to(state, sid, "Purchase failed.");
        return;
    }
    let listing = state.market.listings.remove(position);
    if let Some(player) = state.players.get_mut(sid) {
        player.credits -= listing.price;
        if let Some(unplaced) = add_to_inventory(player, listing.item.clone()) {
            player.credits += listing.price;
            state.market.listings.insert(position, MarketListing { item: unplaced, ..listing });
            return;
        }
    }
    let seller_sid = state
        .players
        .iter()
        .find(|(_, player)| player.username == listing.seller)
        .map(|(id, _)| id.clone());
    if let Some(seller_sid) = seller_sid {
        if let Some(seller) = state.players.get_mut(&seller_sid) {
            seller.credits += listing.price;
        }
        send_system_to(
            state,
            &seller_sid,
            &format!("{} sold for {} credits.", listing.item.name, listing.price),
        );
    } else {
        *state.market.payouts.entry(listing.seller.clone()).or_insert(0) += listing.price;
    }
    state.market_dirty = true;
    send_system_to(state, sid, &format!("Bought {}.", listing.item.name));
}

fn add_to_inventory(player: &mut Player, item: Item) -> Option<Item> {
    for slot in player.inventory.iter_mut() {
        if slot.is_none() {
            *slot = Some(item);
            return None;
        }
    }
    Some(item)
}

fn free_slots(player: &Player) -> usize {
    player.inventory.iter().filter(|slot| slot.is_none()).count()
}

fn item_base_value(tier: u8) -> i64 {
    (tier as i64).pow(2) * 20
}

fn new_item_id() -> String {
    format!("item-{}", Uuid::new_v4())
}

fn spawn_floating_text(state: &mut GameState, x: f32, y: f32, text: String, color: &str) {
    let id = state.next_id();
    state.entities.push(Entity {
        id,
        x,
        y,
        radius: 0.0,
        life: 1.0,
        color: color.to_string(),
        source: None,
        is_dead: false,
        kind: EntityKind::FloatingText { text },
    });
}

fn spawn_equipment_drop(state: &mut GameState, x: f32, y: f32, item: Item, pickup_delay: f32) {
    let id = state.next_id();
    let color = tier_color(item.tier).to_string();
    state.entities.push(Entity {
        id,
        x,
        y,
        radius: 8.0,
        life: 60.0,
        color,
        source: None,
        is_dead: false,
        kind: EntityKind::EquipmentDrop { item, pickup_delay },
    });
}

fn collect_credit_drops(state: &mut GameState) {
    for entity in state.entities.iter_mut() {
        if entity.is_dead {
            continue;
        }
        if let EntityKind::CreditDrop { value } = entity.kind {
            for player in state.players.values_mut() {
                if player.is_dead {
                    continue;
                }
                if distance(player.x, player.y, entity.x, entity.y) < entity.radius + 30.0 {
                    player.credits += value;
                    entity.is_dead = true;
                    break;
                }
            }
        }
    }
}

fn update_lifecycle(state: &mut GameState, dt: f32) {
    // despawn only ticks while somebody is connected
    if !state.players.is_empty() {
        for enemy in state.enemies.values_mut() {
            if enemy.is_dead || enemy.kind.is_boss() || enemy.kind == EnemyKind::LeviathanSegment
            {
                continue;
            }
            let near_player = state.players.values().any(|player| {
                !player.is_dead
                    && distance(player.x, player.y, enemy.x, enemy.y) < DESPAWN_RADIUS
            });
            if near_player {
                enemy.time_outside_range = 0.0;
            } else {
                enemy.time_outside_range += dt;
                if enemy.time_outside_range > DESPAWN_TIME {
                    enemy.is_dead = true;
                }
            }
        }
    }

    let mut due = Vec::new();
    state.boss_respawns.retain_mut(|(kind, timer)| {
        *timer -= dt;
        if *timer <= 0.0 {
            due.push(*kind);
            false
        } else {
            true
        }
    });
    for kind in due {
        if let Some(&(_, x, y)) = BOSS_SITES.iter().find(|(site_kind, _, _)| *site_kind == kind) {
            spawn_boss(state, kind, x, y);
            system_broadcast(state, &format!("{} has returned.", kind.display_name()));
        }
    }

    state.enemy_spawn_timer -= dt;
    if state.enemy_spawn_timer <= 0.0 {
        state.enemy_spawn_timer = ENEMY_SPAWN_INTERVAL;
        spawn_wave(state);
    }
}

fn update_players(state: &mut GameState, dt: f32) {
    let ids: Vec<String> = state.players.keys().cloned().collect();
    for id in ids {
        let mut player = match state.players.remove(&id) {
            Some(player) => player,
            None => continue,
        };
        update_player(&mut player, state, dt);
        state.players.insert(id, player);
    }
}

fn update_player(player: &mut Player, state: &mut GameState, dt: f32) {
    if player.is_dead {
        return;
    }

    player.time_since_last_hit += dt;
    player.gun_cooldown = (player.gun_cooldown - dt).max(0.0);
    player.melee_cooldown = (player.melee_cooldown - dt).max(0.0);
    player.ability_cooldown = (player.ability_cooldown - dt).max(0.0);
    player.teleport_cooldown = (player.teleport_cooldown - dt).max(0.0);

    if player.is_invisible {
        player.invis_timer -= dt;
        if player.invis_timer <= 0.0 {
            player.is_invisible = false;
        }
    }
    if player.shield_active {
        player.shield_timer -= dt;
        if player.shield_timer <= 0.0 {
            player.shield_active = false;
            player.shield_health = 0.0;
        }
    }

    if player.time_since_last_hit > REGEN_DELAY && player.health < player.stats.max_health {
        player.health =
            (player.health + player.stats.health_regen * dt).min(player.stats.max_health);
    }

    // A bound trade freezes movement and combat until it resolves.
    if player.trade.partner_id.is_some() {
        player.is_boosting = false;
        return;
    }

    let inputs = player.inputs;
    let moving = inputs.up || inputs.down || inputs.left || inputs.right;

    if player.is_teleporting {
        if moving || inputs.fire || inputs.melee {
            player.is_teleporting = false;
            send_system_to(state, &player.id, "Recall interrupted.");
        } else {
            player.teleport_timer -= dt;
            if player.teleport_timer <= 0.0 {
                player.is_teleporting = false;
                player.teleport_cooldown = TELEPORT_COOLDOWN;
                player.x = CITY_SPAWN.0;
                player.y = CITY_SPAWN.1;
                broadcast(
                    state,
                    ServerMessage::Sfx {
                        effect: "teleport".to_string(),
                        x: player.x,
                        y: player.y,
                        color: player.color.clone(),
                    },
                );
            }
            return;
        }
    }

    if inputs.teleport && player.teleport_cooldown <= 0.0 && !player.is_teleporting {
        player.is_teleporting = true;
        player.teleport_timer = TELEPORT_CHARGE_TIME;
        player.inputs.teleport = false;
        return;
    }

    // Boost gates off until energy recovers to a quarter tank.
    if !player.can_boost && player.energy >= player.stats.max_energy * 0.25 {
        player.can_boost = true;
    }
    player.is_boosting = inputs.boost && player.can_boost && player.energy > 0.0 && moving;
    if player.is_boosting {
        player.energy = (player.energy - BOOST_ENERGY_DRAIN * dt).max(0.0);
        if player.energy <= 0.0 {
            player.can_boost = false;
            player.is_boosting = false;
        }
    } else {
        player.energy =
            (player.energy + player.stats.energy_regen * dt).min(player.stats.max_energy);
    }

    let mut speed = player.stats.speed;
    if player.is_slowed {
        speed *= 0.5;
        player.is_slowed = false;
    }
    if player.is_boosting {
        speed *= BOOST_SPEED_FACTOR;
    }

    let mut move_x = (inputs.right as i32 - inputs.left as i32) as f32;
    let mut move_y = (inputs.down as i32 - inputs.up as i32) as f32;
    let len = (move_x * move_x + move_y * move_y).sqrt();
    if len > 0.0 {
        move_x /= len;
        move_y /= len;
        let step = speed * dt * 60.0;
        let next_x = player.x + move_x * step;
        if !is_solid(state.world.tile_at(next_x, player.y)) {
            player.x = next_x;
        }
        let next_y = player.y + move_y * step;
        if !is_solid(state.world.tile_at(player.x, next_y)) {
            player.y = next_y;
        }
    }

    if inputs.fire && player.gun_cooldown <= 0.0 {
        fire_weapon(player, state);
    }
    if inputs.melee && player.melee_cooldown <= 0.0 {
        fire_melee(player, state);
    }
    if inputs.ability && player.ability_cooldown <= 0.0 {
        player.inputs.ability = false;
        use_ability(player, state);
    }
    if inputs.interact {
        player.inputs.interact = false;
        attempt_interaction(player, state);
    }
}

fn fire_weapon(player: &mut Player, state: &mut GameState) {
    let weapon = player
        .equipment
        .weapon
        .as_ref()
        .and_then(|item| item.weapon_kind)
        .unwrap_or(WeaponKind::Emitter);
    let damage = player.stats.damage;
    let source = DamageSource {
        player_id: Some(player.id.clone()),
        name: player.username.clone(),
    };

    match weapon {
        WeaponKind::Emitter => {
            spawn_projectile(
                state,
                player.x,
                player.y,
                player.angle,
                15.0,
                1.5,
                4.0,
                damage,
                false,
                0.0,
                source,
                &player.color,
            );
        }
        WeaponKind::Scatter => {
            let mut rng = rand::thread_rng();
            for _ in 0..5 {
                let angle = player.angle + rng.gen_range(-0.2..0.2);
                spawn_projectile(
                    state,
                    player.x,
                    player.y,
                    angle,
                    15.0,
                    1.5,
                    4.0,
                    damage * 0.5,
                    false,
                    0.0,
                    source.clone(),
                    &player.color,
                );
            }
        }
        WeaponKind::Beam => {
            if player.energy < 5.0 {
                return;
            }
            player.energy -= 5.0;
            let id = state.next_id();
            state.entities.push(Entity {
                id,
                x: player.x,
                y: player.y,
                radius: 4.0,
                life: 0.1,
                color: player.color.clone(),
                source: Some(source),
                is_dead: false,
                kind: EntityKind::Beam { angle: player.angle, length: 800.0, damage },
            });
        }
        WeaponKind::Launcher => {
            spawn_projectile(
                state,
                player.x,
                player.y,
                player.angle,
                10.0,
                0.8,
                8.0,
                damage,
                true,
                60.0,
                source,
                &player.color,
            );
        }
    }
    player.gun_cooldown = 1.0 / player.stats.fire_rate;
}

fn fire_melee(player: &mut Player, state: &mut GameState) {
    player.melee_cooldown = MELEE_COOLDOWN;
    let id = state.next_id();
    state.entities.push(Entity {
        id,
        x: player.x,
        y: player.y,
        radius: MELEE_RADIUS,
        life: 0.2,
        color: player.color.clone(),
        source: Some(DamageSource {
            player_id: Some(player.id.clone()),
            name: player.username.clone(),
        }),
        is_dead: false,
        kind: EntityKind::MeleeArc {
            angle: player.angle,
            arc: std::f32::consts::FRAC_PI_2,
            damage: player.stats.damage * 1.5,
            hit_enemies: Vec::new(),
        },
    });
}

fn use_ability(player: &mut Player, state: &mut GameState) {
    match player.class {
        PlayerClass::Phantom => {
            player.is_invisible = true;
            player.invis_timer = 3.0;
            player.ability_cooldown = 12.0;
        }
        PlayerClass::Bulwark => {
            player.shield_active = true;
            player.shield_health = 100.0;
            player.shield_timer = 5.0;
            player.ability_cooldown = 20.0;
        }
        PlayerClass::Reaver => {
            let target_x = player.x + player.angle.cos() * 150.0;
            let target_y = player.y + player.angle.sin() * 150.0;
            if is_solid(state.world.tile_at(target_x, target_y)) {
                return;
            }
            broadcast(
                state,
                ServerMessage::Sfx {
                    effect: "blink".to_string(),
                    x: player.x,
                    y: player.y,
                    color: player.color.clone(),
                },
            );
            player.x = target_x;
            player.y = target_y;
            player.ability_cooldown = 6.0;
        }
    }
}

fn attempt_interaction(player: &mut Player, state: &mut GameState) {
    let mut station = None;
    let mut drop_index = None;
    for (index, entity) in state.entities.iter().enumerate() {
        if entity.is_dead || distance(player.x, player.y, entity.x, entity.y) > INTERACT_RADIUS {
            continue;
        }
        match &entity.kind {
            EntityKind::Station { station: kind, .. } => {
                station = Some(*kind);
                break;
            }
            EntityKind::EquipmentDrop { pickup_delay, .. } => {
                if *pickup_delay <= 0.0 && drop_index.is_none() {
                    drop_index = Some(index);
                }
            }
            _ => {}
        }
    }

    if let Some(kind) = station {
        match kind {
            StationKind::Medbay => {
                player.health = player.stats.max_health;
                player.energy = player.stats.max_energy;
                spawn_floating_text(
                    state,
                    player.x,
                    player.y,
                    "Systems restored".to_string(),
                    "#00ff88",
                );
            }
            StationKind::Console => {
                if player.username == ADMIN_USERNAME {
                    system_broadcast(state, "Ops console accessed.");
                } else {
                    send_system_to(state, &player.id, "Access denied.");
                }
            }
            StationKind::Portal => {
                send_system_to(state, &player.id, "The portal is dormant.");
            }
            StationKind::Bank => {
                let stacks = state.banks.entry(player.username.clone()).or_default().clone();
                send_to(state, &player.id, ServerMessage::OpenBank { stacks });
            }
            StationKind::Exchange => {
                send_to(
                    state,
                    &player.id,
                    ServerMessage::OpenShop {
                        name: "Exchange".to_string(),
                        entries: state.shop.clone(),
                        listings: state.market.listings.clone(),
                    },
                );
            }
        }
        return;
    }

    if let Some(index) = drop_index {
        let mut claimed = false;
        if let EntityKind::EquipmentDrop { item, .. } = &state.entities[index].kind {
            claimed = add_to_inventory(player, item.clone()).is_none();
        }
        if claimed {
            state.entities[index].is_dead = true;
        }
    }
}

fn spawn_projectile(
    state: &mut GameState,
    x: f32,
    y: f32,
    angle: f32,
    speed: f32,
    life: f32,
    radius: f32,
    damage: f32,
    ordnance: bool,
    blast_radius: f32,
    source: DamageSource,
    color: &str,
) {
    let id = state.next_id();
    state.entities.push(Entity {
        id,
        x,
        y,
        radius,
        life,
        color: color.to_string(),
        source: Some(source),
        is_dead: false,
        kind: EntityKind::Projectile { angle, speed, damage, ordnance, blast_radius },
    });
}

fn xp_for_level(level: i32) -> i64 {
    (100.0 * 1.15f64.powi(level - 1)).floor() as i64
}

fn grant_xp(state: &mut GameState, player_id: &str, amount: i64) {
    let mut leveled = None;
    if let Some(player) = state.players.get_mut(player_id) {
        player.xp += amount;
        while player.xp >= player.xp_to_next {
            player.xp -= player.xp_to_next;
            player.level += 1;
            player.xp_to_next = xp_for_level(player.level);
            player.recalculate_stats();
            player.health = player.stats.max_health;
            player.energy = player.stats.max_energy;
            leveled = Some((player.x, player.y, player.level));
        }
    }
    if let Some((x, y, level)) = leveled {
        spawn_floating_text(state, x, y, format!("Level {}", level), "#ffd700");
    }
}

fn damage_player(state: &mut GameState, player_id: &str, amount: f32, source: &DamageSource) {
    let (hit, died, cancel) = {
        let player = match state.players.get_mut(player_id) {
            Some(player) => player,
            None => return,
        };
        if player.is_dead || amount <= 0.0 {
            return;
        }
        player.time_since_last_hit = 0.0;
        player.is_teleporting = false;

        let mut incoming = amount;
        if player.shield_active && player.shield_health > 0.0 {
            let absorbed = incoming.min(player.shield_health);
            player.shield_health -= absorbed;
            incoming -= absorbed;
            if player.shield_health <= 0.0 {
                player.shield_active = false;
            }
        }
        let cancel = player.trade.partner_id.is_some();
        if incoming <= 0.0 {
            (None, false, cancel)
        } else {
            let net = (incoming - player.stats.defense).max(1.0);
            player.health = (player.health - net).max(0.0);
            (
                Some((player.x, player.y, net)),
                player.health <= 0.0,
                cancel,
            )
        }
    };

    if let Some((x, y, net)) = hit {
        spawn_floating_text(state, x, y, format!("{}", net.round() as i32), "#ff4d4d");
    }
    if cancel {
        cancel_trade(state, player_id, "Trade cancelled: combat interruption.");
    }
    if died {
        kill_player(state, player_id, source);
    }
}

fn kill_player(state: &mut GameState, player_id: &str, source: &DamageSource) {
    let mut player = match state.players.remove(player_id) {
        Some(player) => player,
        None => return,
    };
    if !player.is_dead {
        player.is_dead = true;
        player.health = 0.0;
        player.inputs = InputState::default();
        player.is_teleporting = false;
        player.is_boosting = false;

        let cause = source.name.clone();
        let mut items: Vec<Option<Item>> = Vec::new();
        for slot in EquipSlot::ALL {
            if let Some(item) = player.equipment.slot_mut(slot).take() {
                items.push(Some(item));
            }
        }
        for slot in player.inventory.iter_mut() {
            if let Some(item) = slot.take() {
                items.push(Some(item));
            }
        }
        let dropped_credits = (player.credits as f32 * DEATH_CREDIT_FRACTION) as i64;

        let mut bag_id = None;
        if dropped_credits > 0 || !items.is_empty() {
            let id = state.next_id();
            bag_id = Some(id);
            state.entities.push(Entity {
                id,
                x: player.x,
                y: player.y,
                radius: 12.0,
                life: 180.0,
                color: "#d4b106".to_string(),
                source: None,
                is_dead: false,
                kind: EntityKind::LootBag {
                    items,
                    credits: dropped_credits,
                    pickup_delay: LOOT_BAG_PICKUP_DELAY,
                },
            });
        }
        let marker_id = state.next_id();
        state.entities.push(Entity {
            id: marker_id,
            x: player.x,
            y: player.y,
            radius: 10.0,
            life: 180.0,
            color: "#888888".to_string(),
            source: None,
            is_dead: false,
            kind: EntityKind::GraveMarker {
                username: player.username.clone(),
                cause: cause.clone(),
                loot_bag: bag_id,
            },
        });

        send_to(state, player_id, ServerMessage::PlayerDied { cause: cause.clone() });
        system_broadcast(state, &format!("{} was destroyed by {}.", player.username, cause));
    }
    state.players.insert(player_id.to_string(), player);
}

fn trade_request(state: &mut GameState, sid: &str, target_id: &str) {
    if sid == target_id {
        return;
    }
    let sender_free = state
        .players
        .get(sid)
        .map(|player| !player.is_dead && player.trade.partner_id.is_none())
        .unwrap_or(false);
    let target_free = state
        .players
        .get(target_id)
        .map(|player| !player.is_dead && player.trade.partner_id.is_none())
        .unwrap_or(false);
    if !sender_free || !target_free {
        return;
    }
    let from = match state.players.get(sid) {
        Some(player) => PlayerPublic::from(player),
        None => return,
    };
    send_to(state, target_id, ServerMessage::TradeRequest { from });
}

fn start_trade(state: &mut GameState, accepter_id: &str, requester_id: &str) {
    if accepter_id == requester_id {
        return;
    }
    let both_free = [accepter_id, requester_id].iter().all(|id| {
        state
            .players
            .get(*id)
            .map(|player| !player.is_dead && player.trade.partner_id.is_none())
            .unwrap_or(false)
    });
    if !both_free {
        return;
    }
    if let Some(player) = state.players.get_mut(accepter_id) {
        player.trade = TradeState::with_partner(requester_id);
    }
    if let Some(player) = state.players.get_mut(requester_id) {
        player.trade = TradeState::with_partner(accepter_id);
    }
    let accepter = state.players.get(accepter_id).map(PlayerPublic::from);
    let requester = state.players.get(requester_id).map(PlayerPublic::from);
    if let (Some(accepter), Some(requester)) = (accepter, requester) {
        send_to(state, accepter_id, ServerMessage::TradeStarted { partner: requester });
        send_to(state, requester_id, ServerMessage::TradeStarted { partner: accepter });
    }
}

fn trade_offer(state: &mut GameState, sid: &str, item_ids: Vec<String>, credits: i64) {
    let partner_id = match state.players.get(sid).and_then(|p| p.trade.partner_id.clone()) {
        Some(partner_id) => partner_id,
        None => return,
    };
    if let Some(player) = state.players.get_mut(sid) {
        let valid: Vec<String> = item_ids
            .into_iter()
            .filter(|id| {
                player
                    .inventory
                    .iter()
                    .flatten()
                    .any(|item| &item.id == id)
            })
            .collect();
        player.trade.offer_items = valid;
        player.trade.offer_credits = credits.max(0);
        player.trade.accepted_stage1 = false;
        player.trade.accepted_stage2 = false;
    }
    if let Some(partner) = state.players.get_mut(&partner_id) {
        partner.trade.accepted_stage1 = false;
        partner.trade.accepted_stage2 = false;
    }
    let summary = trade_summary(state, sid);
    send_to(
        state,
        &partner_id,
        ServerMessage::TradeOfferUpdate { items: summary.items, credits: summary.credits },
    );
    send_trade_status(state, sid, &partner_id);
}

fn trade_summary(state: &GameState, sid: &str) -> TradeSummary {
    let mut summary = TradeSummary { items: Vec::new(), credits: 0 };
    if let Some(player) = state.players.get(sid) {
        summary.credits = player.trade.offer_credits;
        for id in &player.trade.offer_items {
            if let Some(item) = player
                .inventory
                .iter()
                .flatten()
                .find(|item| &item.id == id)
            {
                summary.items.push(item.clone());
            }
        }
    }
    summary
}

fn send_trade_status(state: &GameState, a_id: &str, b_id: &str) {
    let a_accepted = state
        .players
        .get(a_id)
        .map(|player| player.trade.accepted_stage1)
        .unwrap_or(false);
    let b_accepted = state
        .players
        .get(b_id)
        .map(|player| player.trade.accepted_stage1)
        .unwrap_or(false);
    send_to(
        state,
        a_id,
        ServerMessage::TradeStatus { you_accepted: a_accepted, partner_accepted: b_accepted },
    );
    send_to(
        state,
        b_id,
        ServerMessage::TradeStatus { you_accepted: b_accepted, partner_accepted: a_accepted },
    );
}

fn trade_accept_stage1(state: &mut GameState, sid: &str) {
    let partner_id = match state.players.get(sid).and_then(|p| p.trade.partner_id.clone()) {
        Some(partner_id) => partner_id,
        None => return,
    };
    if let Some(player) = state.players.get_mut(sid) {
        player.trade.accepted_stage1 = true;
    }
    let partner_accepted = state
        .players
        .get(&partner_id)
        .map(|player| player.trade.accepted_stage1)
        .unwrap_or(false);
    if partner_accepted {
        let mine = trade_summary(state, sid);
        let theirs = trade_summary(state, &partner_id);
        send_to(
            state,
            sid,
            ServerMessage::TradeConfirm {
                your_offer: mine.clone(),
                partner_offer: theirs.clone(),
            },
        );
        send_to(
            state,
            &partner_id,
            ServerMessage::TradeConfirm { your_offer: theirs, partner_offer: mine },
        );
    } else {
        send_trade_status(state, sid, &partner_id);
    }
}

fn trade_accept_stage2(state: &mut GameState, sid: &str) {
    let partner_id = match state.players.get(sid).and_then(|p| p.trade.partner_id.clone()) {
        Some(partner_id) => partner_id,
        None => return,
    };
    let stage1_done = [sid, partner_id.as_str()].iter().all(|id| {
        state
            .players
            .get(*id)
            .map(|player| player.trade.accepted_stage1)
            .unwrap_or(false)
    });
    if !stage1_done {
        return;
    }
    if let Some(player) = state.players.get_mut(sid) {
        player.trade.accepted_stage2 = true;
    }
    let partner_accepted = state
        .players
        .get(&partner_id)
        .map(|player| player.trade.accepted_stage2)
        .unwrap_or(false);
    if partner_accepted {
        finalize_trade(state, sid, &partner_id);
    }
}

fn cancel_trade(state: &mut GameState, sid: &str, reason: &str) {
    let partner_id = state.players.get(sid).and_then(|p| p.trade.partner_id.clone());
    if let Some(player) = state.players.get_mut(sid) {
        player.trade = TradeState::default();
    }
    if let Some(partner_id) = &partner_id {
        if let Some(partner) = state.players.get_mut(partner_id) {
            partner.trade = TradeState::default();
        }
    }
    let msg = ServerMessage::TradeCancelled { reason: reason.to_string() };
    send_to(state, sid, msg.clone());
    if let Some(partner_id) = &partner_id {
        send_to(state, partner_id, msg);
    }
}

fn finalize_trade(state: &mut GameState, a_id: &str, b_id: &str) {
    let mut a = match state.players.remove(a_id) {
        Some(player) => player,
        None => return,
    };
    let mut b = match state.players.remove(b_id) {
        Some(player) => player,
        None => {
            state.players.insert(a_id.to_string(), a);
            return;
        }
    };
    let outcome = execute_trade(&mut a, &mut b);
    state.players.insert(a_id.to_string(), a);
    state.players.insert(b_id.to_string(), b);
    match outcome {
        Ok(()) => {
            send_to(state, a_id, ServerMessage::TradeCompleted);
            send_to(state, b_id, ServerMessage::TradeCompleted);
        }
        Err(reason) => {
            cancel_trade(state, a_id, &reason);
        }
    }
}

// All validation happens up front so a failed trade leaves both players
// byte-identical to their pre-trade state.
fn execute_trade(a: &mut Player, b: &mut Player) -> Result<(), String> {
    let a_indices = resolve_offer_indices(a)?;
    let b_indices = resolve_offer_indices(b)?;
    if a.credits < a.trade.offer_credits {
        return Err(format!("{} lacks the offered credits.", a.username));
    }
    if b.credits < b.trade.offer_credits {
        return Err(format!("{} lacks the offered credits.", b.username));
    }
    if free_slots(a) < b_indices.len() {
        return Err(format!("{} has no room for the incoming items.", a.username));
    }
    if free_slots(b) < a_indices.len() {
        return Err(format!("{} has no room for the incoming items.", b.username));
    }

    let a_items: Vec<Item> = a_indices
        .into_iter()
        .filter_map(|index| a.inventory[index].take())
        .collect();
    let b_items: Vec<Item> = b_indices
        .into_iter()
        .filter_map(|index| b.inventory[index].take())
        .collect();

    a.credits = a.credits - a.trade.offer_credits + b.trade.offer_credits;
    b.credits = b.credits - b.trade.offer_credits + a.trade.offer_credits;
    for item in b_items {
        add_to_inventory(a, item);
    }
    for item in a_items {
        add_to_inventory(b, item);
    }
    a.trade = TradeState::default();
    b.trade = TradeState::default();
    Ok(())
}

fn resolve_offer_indices(player: &Player) -> Result<Vec<usize>, String> {
    player
        .trade
        .offer_items
        .iter()
        .map(|id| {
            player
                .inventory
                .iter()
                .position(|slot| slot.as_ref().map(|item| &item.id == id).unwrap_or(false))
                .ok_or_else(|| format!("{}'s offered item is gone.", player.username))
        })
        .collect()
}

fn targetable(player: &Player) -> bool {
    !player.is_dead
        && !player.is_invisible
        && !player.is_teleporting
        && player.trade.partner_id.is_none()
}

fn nearest_target(state: &GameState, x: f32, y: f32, range: f32) -> Option<(String, f32, f32, f32)> {
    let mut best: Option<(String, f32, f32, f32)> = None;
    for (id, player) in &state.players {
        if !targetable(player) || is_city(player.x, player.y) {
            continue;
        }
        let dist = distance(x, y, player.x, player.y);
        if dist < range && best.as_ref().map(|(_, _, _, b)| dist < *b).unwrap_or(true) {
            best = Some((id.clone(), player.x, player.y, dist));
        }
    }
    best
}

fn update_enemies(state: &mut GameState, dt: f32) {
    let mut enemies = std::mem::take(&mut state.enemies);
    let ids: Vec<u64> = enemies.keys().copied().collect();
    for id in ids {
        let mut enemy = match enemies.remove(&id) {
            Some(enemy) => enemy,
            None => continue,
        };
        if !enemy.is_dead {
            match enemy.kind {
                EnemyKind::Drifter | EnemyKind::Swarmer => {
                    update_ground_enemy(&mut enemy, state, dt);
                }
                EnemyKind::Lancer => {
                    update_ground_enemy(&mut enemy, state, dt);
                    update_lancer(&mut enemy, state);
                }
                EnemyKind::Custodian => {
                    update_ground_enemy(&mut enemy, state, dt);
                    update_custodian(&mut enemy, state, dt);
                }
                EnemyKind::Singularity => update_singularity(&mut enemy, &mut enemies, state, dt),
                EnemyKind::Colossus => update_colossus(&mut enemy, state, dt),
                EnemyKind::LeviathanHead => {
                    update_leviathan_head(&mut enemy, &mut enemies, state, dt)
                }
                EnemyKind::LeviathanSegment => update_leviathan_segment(&mut enemy, state, dt),
                EnemyKind::Augur => update_augur(&mut enemy, state, dt),
                EnemyKind::Stalker => update_stalker(&mut enemy, state, dt),
            }
        }
        enemies.insert(id, enemy);
    }
    // merge in anything spawned while the map was detached (summons)
    for (id, enemy) in state.enemies.drain() {
        enemies.insert(id, enemy);
    }
    state.enemies = enemies;
}

fn step_towards(
    enemy: &mut Enemy,
    state: &mut GameState,
    tx: f32,
    ty: f32,
    speed: f32,
    dt: f32,
) -> bool {
    let dx = tx - enemy.x;
    let dy = ty - enemy.y;
    let len = (dx * dx + dy * dy).sqrt();
    if len <= f32::EPSILON {
        return true;
    }
    let step = speed * dt * 60.0;
    let next_x = enemy.x + dx / len * step;
    let next_y = enemy.y + dy / len * step;
    let mut moved = false;
    if !is_city(next_x, enemy.y) && !is_solid(state.world.tile_at(next_x, enemy.y)) {
        enemy.x = next_x;
        moved = true;
    }
    if !is_city(enemy.x, next_y) && !is_solid(state.world.tile_at(enemy.x, next_y)) {
        enemy.y = next_y;
        moved = true;
    }
    moved
}

fn update_ground_enemy(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    enemy.shoot_cooldown = (enemy.shoot_cooldown - dt).max(0.0);
    enemy.ability_cooldown = (enemy.ability_cooldown - dt).max(0.0);

    if let Some((target_id, tx, ty, dist)) = nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius) {
        enemy.wander_target = None;
        if dist > enemy.radius + PLAYER_RADIUS {
            step_towards(enemy, state, tx, ty, enemy.speed, dt);
        } else {
            let source = enemy.damage_source();
            damage_player(state, &target_id, 40.0 * enemy.damage_mult * dt, &source);
        }
    } else {
        wander(enemy, state, dt);
    }
}

fn wander(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    enemy.wander_timer -= dt;
    if enemy.wander_timer <= 0.0 {
        let mut rng = rand::thread_rng();
        enemy.wander_timer = rng.gen_range(2.0..5.0);
        let angle = rng.gen_range(0.0..std::f32::consts::TAU);
        let dist = rng.gen_range(50.0..200.0);
        enemy.wander_target =
            Some((enemy.x + angle.cos() * dist, enemy.y + angle.sin() * dist));
    }
    if let Some((tx, ty)) = enemy.wander_target {
        if distance(enemy.x, enemy.y, tx, ty) < 5.0
            || !step_towards(enemy, state, tx, ty, enemy.speed * 0.5, dt)
        {
            enemy.wander_target = None;
        }
    }
}

fn update_lancer(enemy: &mut Enemy, state: &mut GameState) {
    if enemy.shoot_cooldown > 0.0 {
        return;
    }
    if let Some((_, tx, ty, _)) = nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius) {
        enemy.shoot_cooldown = 1.6;
        let angle = (ty - enemy.y).atan2(tx - enemy.x);
        spawn_projectile(
            state,
            enemy.x,
            enemy.y,
            angle,
            15.0,
            0.8,
            4.0,
            30.0 * enemy.damage_mult,
            false,
            0.0,
            enemy.damage_source(),
            "#ff8844",
        );
    }
}

fn update_custodian(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    if enemy.ability_cooldown > 0.0 {
        return;
    }
    let caught: Vec<String> = state
        .players
        .iter()
        .filter(|(_, player)| {
            !player.is_dead && distance(enemy.x, enemy.y, player.x, player.y) < 250.0
        })
        .map(|(id, _)| id.clone())
        .collect();
    if caught.is_empty() {
        return;
    }
    enemy.ability_cooldown = 5.0;
    let pull = 800.0 * dt;
    for id in caught {
        let (next_x, next_y) = match state.players.get_mut(&id) {
            Some(player) => {
                player.is_slowed = true;
                let dist = distance(player.x, player.y, enemy.x, enemy.y).max(1.0);
                (
                    player.x + (enemy.x - player.x) / dist * pull,
                    player.y + (enemy.y - player.y) / dist * pull,
                )
            }
            None => continue,
        };
        if !is_solid(state.world.tile_at(next_x, next_y)) {
            if let Some(player) = state.players.get_mut(&id) {
                player.x = next_x;
                player.y = next_y;
            }
        }
    }
    broadcast(
        state,
        ServerMessage::Sfx {
            effect: "pulse".to_string(),
            x: enemy.x,
            y: enemy.y,
            color: "#8866ff".to_string(),
        },
    );
}

fn update_singularity(
    enemy: &mut Enemy,
    enemies: &mut HashMap<u64, Enemy>,
    state: &mut GameState,
    dt: f32,
) {
    const PULL_RADIUS: f32 = 300.0;
    const PULL_STRENGTH: f32 = 25.0;

    let mut consumed = Vec::new();
    for (id, player) in state.players.iter_mut() {
        if player.is_dead {
            continue;
        }
        let dist = distance(player.x, player.y, enemy.x, enemy.y);
        if dist < enemy.radius {
            consumed.push(id.clone());
            continue;
        }
        if player.is_teleporting || dist >= PULL_RADIUS {
            continue;
        }
        let mut force = (1.0 - dist / PULL_RADIUS) * PULL_STRENGTH * dt * 60.0;
        if player.is_boosting {
            force *= 0.5;
        }
        let next_x = player.x + (enemy.x - player.x) / dist * force;
        let next_y = player.y + (enemy.y - player.y) / dist * force;
        if !is_solid(state.world.tile_at(next_x, player.y)) {
            player.x = next_x;
        }
        if !is_solid(state.world.tile_at(player.x, next_y)) {
            player.y = next_y;
        }
    }
    let source = enemy.damage_source();
    for id in consumed {
        damage_player(state, &id, 100000.0, &source);
    }

    for other in enemies.values_mut() {
        if other.is_dead
            || other.kind.is_boss()
            || matches!(other.kind, EnemyKind::LeviathanSegment | EnemyKind::Singularity)
        {
            continue;
        }
        let dist = distance(other.x, other.y, enemy.x, enemy.y);
        if dist < enemy.radius {
            // erased outright, no death effects
            other.is_dead = true;
        } else if dist < PULL_RADIUS {
            let force = (1.0 - dist / PULL_RADIUS) * PULL_STRENGTH * dt * 60.0;
            let next_x = other.x + (enemy.x - other.x) / dist * force;
            let next_y = other.y + (enemy.y - other.y) / dist * force;
            if !is_solid(state.world.tile_at(next_x, other.y)) {
                other.x = next_x;
            }
            if !is_solid(state.world.tile_at(other.x, next_y)) {
                other.y = next_y;
            }
        }
    }

    for entity in state.entities.iter_mut() {
        if entity.is_dead {
            continue;
        }
        if !matches!(
            entity.kind,
            EntityKind::Projectile { .. }
                | EntityKind::CreditDrop { .. }
                | EntityKind::EquipmentDrop { .. }
        ) {
            continue;
        }
        let dist = distance(entity.x, entity.y, enemy.x, enemy.y);
        if dist < enemy.radius {
            entity.is_dead = true;
        } else if dist < PULL_RADIUS {
            let force = (1.0 - dist / PULL_RADIUS) * PULL_STRENGTH * dt * 60.0;
            let next_x = entity.x + (enemy.x - entity.x) / dist * force;
            let next_y = entity.y + (enemy.y - entity.y) / dist * force;
            if !is_solid(state.world.tile_at(next_x, entity.y)) {
                entity.x = next_x;
            }
            if !is_solid(state.world.tile_at(entity.x, next_y)) {
                entity.y = next_y;
            }
        }
    }
}

fn update_colossus(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    enemy.phase_timer -= dt;
    let home_dist = distance(enemy.x, enemy.y, enemy.spawn_x, enemy.spawn_y);
    if home_dist > enemy.leash_radius {
        step_towards(enemy, state, enemy.spawn_x, enemy.spawn_y, enemy.speed * 2.0, dt);
        return;
    }
    let (target_id, tx, ty, dist) =
        match nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius) {
            Some(target) => target,
            None => {
                if home_dist > 50.0 {
                    step_towards(enemy, state, enemy.spawn_x, enemy.spawn_y, enemy.speed, dt);
                }
                return;
            }
        };
    if dist > 400.0 {
        step_towards(enemy, state, tx, ty, enemy.speed, dt);
    }
    if enemy.phase_timer > 0.0 {
        return;
    }
    match enemy.phase {
        BossPhase::Mortar => {
            enemy.phase = BossPhase::Barrage;
            enemy.phase_timer = 5.0;
            let id = state.next_id();
            state.entities.push(Entity {
                id,
                x: tx,
                y: ty,
                radius: 15.0,
                life: 2.0,
                color: "#ff3300".to_string(),
                source: Some(enemy.damage_source()),
                is_dead: false,
                kind: EntityKind::Mortar { damage: 40.0, blast_radius: 150.0 },
            });
        }
        _ => {
            enemy.phase = BossPhase::Mortar;
            enemy.phase_timer = 3.0;
            for shot in 0..10 {
                state.deferred.push(Deferred {
                    delay: shot as f32 * 0.1,
                    action: DeferredAction::BossShot {
                        enemy_id: enemy.id,
                        target_id: target_id.clone(),
                        damage: 80.0,
                        spread: 0.15,
                        speed: 15.0,
                        life: 1.5,
                        radius: 10.0,
                    },
                });
            }
        }
    }
}

fn update_leviathan_head(
    enemy: &mut Enemy,
    enemies: &mut HashMap<u64, Enemy>,
    state: &mut GameState,
    dt: f32,
) {
    enemy.shoot_cooldown = (enemy.shoot_cooldown - dt).max(0.0);
    let home_dist = distance(enemy.x, enemy.y, enemy.spawn_x, enemy.spawn_y);
    let target = nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius);

    match target {
        Some((_, tx, ty, dist)) if home_dist <= enemy.leash_radius => {
            if dist > 300.0 {
                step_towards(enemy, state, tx, ty, enemy.speed, dt);
            }
            if enemy.shoot_cooldown <= 0.0 {
                enemy.shoot_cooldown = 0.3;
                let angle = (ty - enemy.y).atan2(tx - enemy.x);
                spawn_projectile(
                    state,
                    enemy.x,
                    enemy.y,
                    angle,
                    15.0,
                    1.2,
                    8.0,
                    60.0,
                    false,
                    0.0,
                    enemy.damage_source(),
                    "#66ff99",
                );
            }
        }
        _ => {
            if home_dist > 50.0 {
                step_towards(enemy, state, enemy.spawn_x, enemy.spawn_y, enemy.speed, dt);
            }
        }
    }

    // segments trail the head as a chain
    let mut lead_x = enemy.x;
    let mut lead_y = enemy.y;
    let mut lead_radius = enemy.radius;
    for seg_id in &enemy.segments {
        if let Some(segment) = enemies.get_mut(seg_id) {
            if segment.is_dead {
                continue;
            }
            let dist = distance(segment.x, segment.y, lead_x, lead_y);
            let follow_dist = segment.radius + lead_radius - 15.0;
            if dist > follow_dist && dist > 0.0 {
                let pull = (dist - follow_dist).min(12.0 * dt * 60.0);
                segment.x += (lead_x - segment.x) / dist * pull;
                segment.y += (lead_y - segment.y) / dist * pull;
            }
            lead_x = segment.x;
            lead_y = segment.y;
            lead_radius = segment.radius;
        }
    }
}

fn update_leviathan_segment(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    enemy.shoot_cooldown -= dt;
    if enemy.shoot_cooldown > 0.0 {
        return;
    }
    if let Some((_, tx, ty, _)) = nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius) {
        enemy.shoot_cooldown = rand::thread_rng().gen_range(2.0..5.0);
        let angle = (ty - enemy.y).atan2(tx - enemy.x);
        spawn_projectile(
            state,
            enemy.x,
            enemy.y,
            angle,
            15.0,
            1.0,
            4.0,
            40.0,
            false,
            0.0,
            enemy.damage_source(),
            "#66ff99",
        );
    }
}

fn update_augur(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    if nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius).is_none() {
        return;
    }
    enemy.phase_timer -= dt;
    if enemy.phase_timer > 0.0 {
        return;
    }
    match enemy.phase {
        BossPhase::Summon => {
            enemy.phase = BossPhase::Barrage;
            enemy.phase_timer = 5.0;
            let mut rng = rand::thread_rng();
            for _ in 0..5 {
                let angle = rng.gen_range(0.0..std::f32::consts::TAU);
                let x = enemy.x + angle.cos() * 150.0;
                let y = enemy.y + angle.sin() * 150.0;
                spawn_enemy(state, EnemyKind::Lancer, x, y, 4);
            }
        }
        _ => {
            enemy.phase = BossPhase::Summon;
            enemy.phase_timer = 3.5;
            let rotation = (now_secs() % std::f64::consts::TAU) as f32;
            for step in 0..12 {
                let angle = (step as f32 / 12.0) * std::f32::consts::TAU + rotation;
                spawn_projectile(
                    state,
                    enemy.x,
                    enemy.y,
                    angle,
                    15.0,
                    1.5,
                    8.0,
                    50.0,
                    false,
                    0.0,
                    enemy.damage_source(),
                    "#cc66ff",
                );
            }
        }
    }
}

fn update_stalker(enemy: &mut Enemy, state: &mut GameState, dt: f32) {
    if let Some(target_id) = enemy.locked_target.clone() {
        let alive = state
            .players
            .get(&target_id)
            .map(|player| !player.is_dead)
            .unwrap_or(false);
        if !alive {
            // lost its prey: back to the lair, recloaked
            enemy.locked_target = None;
            enemy.is_invisible = true;
            enemy.x = enemy.spawn_x;
            enemy.y = enemy.spawn_y;
            enemy.phase_timer = 3.0;
            return;
        }
    }
    if enemy.locked_target.is_none() {
        match nearest_target(state, enemy.x, enemy.y, enemy.aggro_radius) {
            Some((id, _, _, _)) => enemy.locked_target = Some(id),
            None => return,
        }
    }
    let target_id = match enemy.locked_target.clone() {
        Some(id) => id,
        None => return,
    };
    let (tx, ty) = match state.players.get(&target_id) {
        Some(player) => (player.x, player.y),
        None => return,
    };
    if distance(enemy.x, enemy.y, tx, ty) > 200.0 {
        step_towards(enemy, state, tx, ty, enemy.speed, dt);
    }
    if enemy.is_invisible {
        enemy.phase_timer -= dt;
        if enemy.phase_timer <= 0.0 {
            enemy.phase_timer = 5.0;
            enemy.is_invisible = false;
            state.deferred.push(Deferred {
                delay: 1.0,
                action: DeferredAction::StalkerBurst { enemy_id: enemy.id },
            });
        }
    }
}

fn run_deferred(state: &mut GameState, dt: f32) {
    let mut queue = std::mem::take(&mut state.deferred);
    let mut due = Vec::new();
    queue.retain_mut(|entry| {
        entry.delay -= dt;
        if entry.delay <= 0.0 {
            due.push(entry.action.clone());
            false
        } else {
            true
        }
    });
    for action in due {
        fire_deferred(state, action);
    }
    queue.append(&mut state.deferred);
    state.deferred = queue;
}

fn fire_deferred(state: &mut GameState, action: DeferredAction) {
    match action {
        DeferredAction::BossShot { enemy_id, target_id, damage, spread, speed, life, radius } => {
            let (ex, ey, source) = match state.enemies.get(&enemy_id) {
                Some(enemy) if !enemy.is_dead => (enemy.x, enemy.y, enemy.damage_source()),
                _ => return,
            };
            let (tx, ty) = match state.players.get(&target_id) {
                Some(player) if !player.is_dead => (player.x, player.y),
                _ => return,
            };
            let mut rng = rand::thread_rng();
            let angle = (ty - ey).atan2(tx - ex) + rng.gen_range(-spread..spread);
            spawn_projectile(
                state, ex, ey, angle, speed, life, radius, damage, false, 0.0, source, "#ff3300",
            );
        }
        DeferredAction::StalkerBurst { enemy_id } => {
            let (ex, ey, target_id, source) = match state.enemies.get(&enemy_id) {
                Some(enemy) if !enemy.is_dead && enemy.locked_target.is_some() => (
                    enemy.x,
                    enemy.y,
                    enemy.locked_target.clone().unwrap_or_default(),
                    enemy.damage_source(),
                ),
                _ => return,
            };
            let (tx, ty) = match state.players.get(&target_id) {
                Some(player) if !player.is_dead => (player.x, player.y),
                _ => return,
            };
            let mut rng = rand::thread_rng();
            for _ in 0..10 {
                let angle = (ty - ey).atan2(tx - ex) + rng.gen_range(-0.4..0.4);
                spawn_projectile(
                    state,
                    ex,
                    ey,
                    angle,
                    15.0,
                    0.5,
                    6.0,
                    120.0,
                    false,
                    0.0,
                    source.clone(),
                    "#ff0066",
                );
            }
            state.deferred.push(Deferred {
                delay: 1.0,
                action: DeferredAction::StalkerRecloak { enemy_id },
            });
        }
        DeferredAction::StalkerRecloak { enemy_id } => {
            let anchor = state
                .enemies
                .get(&enemy_id)
                .filter(|enemy| !enemy.is_dead)
                .and_then(|enemy| enemy.locked_target.clone())
                .and_then(|target_id| state.players.get(&target_id))
                .map(|player| (player.x, player.y));
            if let Some(enemy) = state.enemies.get_mut(&enemy_id) {
                if enemy.is_dead {
                    return;
                }
                enemy.is_invisible = true;
                if let Some((tx, ty)) = anchor {
                    let angle = rand::thread_rng().gen_range(0.0..std::f32::consts::TAU);
                    enemy.x = tx + angle.cos() * 400.0;
                    enemy.y = ty + angle.sin() * 400.0;
                }
            }
        }
    }
}

fn update_entities(state: &mut GameState, dt: f32) {
    let mut entities = std::mem::take(&mut state.entities);
    for entity in entities.iter_mut() {
        if entity.is_dead {
            continue;
        }
        match &mut entity.kind {
            EntityKind::Projectile { angle, speed, ordnance, blast_radius, damage } => {
                entity.life -= dt;
                entity.x += angle.cos() * *speed * dt * 60.0;
                entity.y += angle.sin() * *speed * dt * 60.0;
                let blocked = is_solid(state.world.tile_at(entity.x, entity.y));
                if entity.life <= 0.0 || blocked {
                    entity.is_dead = true;
                    if *ordnance {
                        spawn_shockwave(
                            state,
                            entity.x,
                            entity.y,
                            *blast_radius,
                            *damage,
                            entity.source.clone(),
                            &entity.color,
                        );
                    }
                }
            }
            EntityKind::Mortar { damage, blast_radius } => {
                entity.life -= dt;
                if entity.life <= 0.0 {
                    entity.is_dead = true;
                    spawn_shockwave(
                        state,
                        entity.x,
                        entity.y,
                        *blast_radius,
                        *damage,
                        entity.source.clone(),
                        &entity.color,
                    );
                }
            }
            EntityKind::Shockwave { max_radius, .. } => {
                entity.life -= dt;
                entity.radius = (entity.radius + *max_radius * 3.0 * dt).min(*max_radius);
                if entity.life <= 0.0 {
                    entity.is_dead = true;
                }
            }
            EntityKind::FloatingText { .. } => {
                entity.life -= dt;
                entity.y -= 20.0 * dt;
                if entity.life <= 0.0 {
                    entity.is_dead = true;
                }
            }
            EntityKind::EquipmentDrop { pickup_delay, .. } => {
                entity.life -= dt;
                *pickup_delay = (*pickup_delay - dt).max(0.0);
                if entity.life <= 0.0 {
                    entity.is_dead = true;
                }
            }
            EntityKind::LootBag { pickup_delay, items, credits } => {
                entity.life -= dt;
                *pickup_delay = (*pickup_delay - dt).max(0.0);
                let emptied = *credits <= 0 && items.iter().all(|slot| slot.is_none());
                if entity.life <= 0.0 || emptied {
                    entity.is_dead = true;
                }
            }
            EntityKind::Beam { .. }
            | EntityKind::MeleeArc { .. }
            | EntityKind::CreditDrop { .. }
            | EntityKind::GraveMarker { .. } => {
                entity.life -= dt;
                if entity.life <= 0.0 {
                    entity.is_dead = true;
                }
            }
            EntityKind::Station { .. } => {}
        }
    }
    entities.append(&mut state.entities);
    state.entities = entities;
}

fn spawn_shockwave(
    state: &mut GameState,
    x: f32,
    y: f32,
    max_radius: f32,
    damage: f32,
    source: Option<DamageSource>,
    color: &str,
) {
    let id = state.next_id();
    state.entities.push(Entity {
        id,
        x,
        y,
        radius: 1.0,
        life: 0.5,
        color: color.to_string(),
        source,
        is_dead: false,
        kind: EntityKind::Shockwave {
            max_radius,
            damage,
            hit_players: HashSet::new(),
            hit_enemies: HashSet::new(),
        },
    });
}

fn angle_gap(a: f32, b: f32) -> f32 {
    let mut diff = (a - b) % std::f32::consts::TAU;
    if diff > std::f32::consts::PI {
        diff -= std::f32::consts::TAU;
    }
    if diff < -std::f32::consts::PI {
        diff += std::f32::consts::TAU;
    }
    diff.abs()
}

fn resolve_collisions(state: &mut GameState, dt: f32) {
    let mut entities = std::mem::take(&mut state.entities);
    for entity in entities.iter_mut() {
        if entity.is_dead {
            continue;
        }
        let source = match entity.source.clone() {
            Some(source) => source,
            None => continue,
        };
        let owner_is_player = source
            .player_id
            .as_deref()
            .map(|id| state.players.contains_key(id))
            .unwrap_or(false);

        match &mut entity.kind {
            EntityKind::Projectile { damage, ordnance, blast_radius, .. } => {
                let damage = *damage;
                let ordnance = *ordnance;
                let blast_radius = *blast_radius;

                let mut hit_player = None;
                for (id, player) in &state.players {
                    if player.is_dead || source.player_id.as_deref() == Some(id.as_str()) {
                        continue;
                    }
                    if owner_is_player && is_city(player.x, player.y) {
                        continue;
                    }
                    if distance(entity.x, entity.y, player.x, player.y)
                        < entity.radius + PLAYER_RADIUS
                    {
                        hit_player = Some(id.clone());
                        break;
                    }
                }
                if let Some(id) = hit_player {
                    entity.is_dead = true;
                    damage_player(state, &id, damage, &source);
                    if ordnance {
                        spawn_shockwave(
                            state,
                            entity.x,
                            entity.y,
                            blast_radius,
                            damage,
                            Some(source),
                            &entity.color,
                        );
                    }
                    continue;
                }

                if owner_is_player {
                    let mut hit_enemy = None;
                    for (id, enemy) in &state.enemies {
                        if enemy.is_dead {
                            continue;
                        }
                        if distance(entity.x, entity.y, enemy.x, enemy.y)
                            < entity.radius + enemy.radius
                        {
                            hit_enemy = Some(*id);
                            break;
                        }
                    }
                    if let Some(id) = hit_enemy {
                        entity.is_dead = true;
                        damage_enemy(state, id, damage, &source);
                        if ordnance {
                            spawn_shockwave(
                                state,
                                entity.x,
                                entity.y,
                                blast_radius,
                                damage,
                                Some(source),
                                &entity.color,
                            );
                        }
                    }
                }
            }
            EntityKind::MeleeArc { angle, arc, damage, hit_enemies } => {
                if !owner_is_player {
                    continue;
                }
                let owner_id = match source.player_id.as_deref() {
                    Some(id) => id,
                    None => continue,
                };
                let (ox, oy) = match state.players.get(owner_id) {
                    Some(player) => (player.x, player.y),
                    None => continue,
                };
                let mut hits = Vec::new();
                for (id, enemy) in &state.enemies {
                    if enemy.is_dead || hit_enemies.contains(id) {
                        continue;
                    }
                    let dist = distance(ox, oy, enemy.x, enemy.y);
                    if dist > entity.radius + enemy.radius {
                        continue;
                    }
                    let to_enemy = (enemy.y - oy).atan2(enemy.x - ox);
                    if angle_gap(to_enemy, *angle) < *arc / 2.0 {
                        hits.push((*id, enemy.kind.is_boss()));
                    }
                }
                let damage = *damage;
                let swing = *angle;
                for (id, is_boss) in hits {
                    hit_enemies.push(id);
                    damage_enemy(state, id, damage, &source);
                    if !is_boss {
                        knockback_enemy(state, id, swing, MELEE_KNOCKBACK);
                    }
                }
            }
            EntityKind::Beam { angle, length, damage } => {
                if !owner_is_player {
                    continue;
                }
                let mut hits = Vec::new();
                for (id, enemy) in &state.enemies {
                    if enemy.is_dead {
                        continue;
                    }
                    let dist = distance(entity.x, entity.y, enemy.x, enemy.y);
                    if dist > *length || dist < 1.0 {
                        continue;
                    }
                    let to_enemy = (enemy.y - entity.y).atan2(enemy.x - entity.x);
                    if angle_gap(to_enemy, *angle) < (enemy.radius / dist).atan() {
                        hits.push(*id);
                    }
                }
                let burn = *damage * 20.0 * dt;
                for id in hits {
                    damage_enemy(state, id, burn, &source);
                }
            }
            EntityKind::Shockwave { damage, hit_players, hit_enemies, .. } => {
                let damage = *damage;
                let mut player_hits = Vec::new();
                for (id, player) in &state.players {
                    if player.is_dead
                        || hit_players.contains(id)
                        || source.player_id.as_deref() == Some(id.as_str())
                    {
                        continue;
                    }
                    if owner_is_player && is_city(player.x, player.y) {
                        continue;
                    }
                    if distance(entity.x, entity.y, player.x, player.y)
                        < entity.radius + PLAYER_RADIUS
                    {
                        player_hits.push(id.clone());
                    }
                }
                for id in player_hits {
                    hit_players.insert(id.clone());
                    damage_player(state, &id, damage, &source);
                }
                let mut enemy_hits = Vec::new();
                for (id, enemy) in &state.enemies {
                    if enemy.is_dead || hit_enemies.contains(id) {
                        continue;
                    }
                    if distance(entity.x, entity.y, enemy.x, enemy.y)
                        < entity.radius + enemy.radius
                    {
                        enemy_hits.push(*id);
                    }
                }
                for id in enemy_hits {
                    hit_enemies.insert(id);
                    damage_enemy(state, id, damage, &source);
                }
            }
            _ => {}
        }
    }
    entities.append(&mut state.entities);
    state.entities = entities;
}

fn knockback_enemy(state: &mut GameState, enemy_id: u64, angle: f32, strength: f32) {
    let (next_x, next_y, x, y) = match state.enemies.get(&enemy_id) {
        Some(enemy) if !enemy.is_dead => (
            enemy.x + angle.cos() * strength,
            enemy.y + angle.sin() * strength,
            enemy.x,
            enemy.y,
        ),
        _ => return,
    };
    let clear_x = !is_city(next_x, y) && !is_solid(state.world.tile_at(next_x, y));
    let clear_y = !is_city(x, next_y) && !is_solid(state.world.tile_at(x, next_y));
    if let Some(enemy) = state.enemies.get_mut(&enemy_id) {
        if clear_x {
            enemy.x = next_x;
        }
        if clear_y {
            enemy.y = next_y;
        }
    }
}

fn damage_enemy(state: &mut GameState, enemy_id: u64, amount: f32, source: &DamageSource) {
    let mut enemy = match state.enemies.remove(&enemy_id) {
        Some(enemy) => enemy,
        None => return,
    };
    if enemy.is_dead || enemy.kind == EnemyKind::Singularity {
        state.enemies.insert(enemy_id, enemy);
        return;
    }
    let mut amount = amount;
    if enemy.kind == EnemyKind::LeviathanHead {
        let guarded = enemy.segments.iter().any(|seg_id| {
            state
                .enemies
                .get(seg_id)
                .map(|segment| !segment.is_dead)
                .unwrap_or(false)
        });
        if guarded {
            amount *= 0.1;
        }
    }
    if enemy.shield > 0.0 {
        let absorbed = amount.min(enemy.shield);
        enemy.shield -= absorbed;
        amount -= absorbed;
    }
    if amount > 0.0 {
        enemy.health -= amount;
        spawn_floating_text(
            state,
            enemy.x,
            enemy.y,
            format!("{}", amount.round() as i32),
            "#ffffff",
        );
        if enemy.health <= 0.0 {
            enemy.health = 0.0;
            enemy.is_dead = true;
            enemy_death_effects(state, &enemy, source);
        }
    }
    state.enemies.insert(enemy_id, enemy);
}

fn enemy_death_effects(state: &mut GameState, enemy: &Enemy, source: &DamageSource) {
    if let Some(player_id) = &source.player_id {
        let player_id = player_id.clone();
        grant_xp(state, &player_id, enemy.xp_value);
    }
    let mut rng = rand::thread_rng();

    if enemy.kind.is_boss() {
        system_broadcast(
            state,
            &format!("{} has been destroyed by {}!", enemy.kind.display_name(), source.name),
        );
        state.boss_respawns.push((enemy.kind, BOSS_RESPAWN_DELAY));
        for _ in 0..2 {
            let item = generate_equipment(5, &mut rng);
            let x = enemy.x + rng.gen_range(-30.0..30.0);
            let y = enemy.y + rng.gen_range(-30.0..30.0);
            spawn_equipment_drop(state, x, y, item, 0.5);
        }
        if rng.gen_bool(0.5) {
            for _ in 0..3 {
                let tier = rng.gen_range(4..=5);
                let item = generate_equipment(tier, &mut rng);
                let x = enemy.x + rng.gen_range(-40.0..40.0);
                let y = enemy.y + rng.gen_range(-40.0..40.0);
                spawn_equipment_drop(state, x, y, item, 0.5);
            }
        }
        return;
    }

    for _ in 0..2 {
        let id = state.next_id();
        state.entities.push(Entity {
            id,
            x: enemy.x + rng.gen_range(-10.0..10.0),
            y: enemy.y + rng.gen_range(-10.0..10.0),
            radius: 5.0,
            life: 60.0,
            color: "#ffd700".to_string(),
            source: None,
            is_dead: false,
            kind: EntityKind::CreditDrop { value: enemy.threat.max(1) as i64 * 5 },
        });
    }
    let drop_chance = (0.01 + 0.025 * enemy.threat as f64).min(1.0);
    if rng.gen_bool(drop_chance) {
        let bonus: u8 = if rng.gen_bool(0.05) { 2 } else { rng.gen_range(0..=1) };
        let tier = (enemy.threat + bonus).clamp(1, 5);
        let item = generate_equipment(tier, &mut rng);
        spawn_equipment_drop(state, enemy.x, enemy.y, item, 0.5);
    }
}

fn spawn_enemy(state: &mut GameState, kind: EnemyKind, x: f32, y: f32, threat: u8) -> u64 {
    let id = state.next_id();
    let enemy = Enemy::new(id, kind, x, y, threat);
    state.enemies.insert(id, enemy);
    id
}

fn spawn_boss(state: &mut GameState, kind: EnemyKind, x: f32, y: f32) {
    let boss_id = spawn_enemy(state, kind, x, y, 5);
    if kind == EnemyKind::LeviathanHead {
        let mut segment_ids = Vec::new();
        for index in 0..8 {
            let seg_x = x - (index as f32 + 1.0) * 35.0;
            let seg_id = spawn_enemy(state, EnemyKind::LeviathanSegment, seg_x, y, 5);
            if let Some(segment) = state.enemies.get_mut(&seg_id) {
                segment.head_id = Some(boss_id);
            }
            segment_ids.push(seg_id);
        }
        if let Some(head) = state.enemies.get_mut(&boss_id) {
            head.segments = segment_ids;
        }
    }
}

fn spawn_wave(state: &mut GameState) {
    if state.enemies.len() >= MAX_ENEMIES {
        return;
    }
    let mut rng = rand::thread_rng();
    let anchors: Vec<(f32, f32)> = state
        .players
        .values()
        .filter(|player| !player.is_dead && !is_city(player.x, player.y))
        .map(|player| (player.x, player.y))
        .collect();
    for (px, py) in anchors {
        if state.enemies.len() >= MAX_ENEMIES {
            break;
        }
        if rng.gen_bool(0.5) {
            continue;
        }
        let angle = rng.gen_range(0.0..std::f32::consts::TAU);
        let spawn_x = px + angle.cos() * 1000.0;
        let spawn_y = py + angle.sin() * 1000.0;
        if is_city(spawn_x, spawn_y) || is_solid(state.world.tile_at(spawn_x, spawn_y)) {
            continue;
        }
        let threat = threat_level(spawn_x, spawn_y).max(1);
        let dist_tiles = spawn_x.hypot(spawn_y) / TILE_SIZE;
        let kind = if dist_tiles > 500.0 && rng.gen_bool(0.2) {
            EnemyKind::Singularity
        } else if dist_tiles > 400.0 && rng.gen_bool(0.6) {
            EnemyKind::Swarmer
        } else if threat >= 3 && rng.gen_bool(0.3) {
            EnemyKind::Custodian
        } else if threat >= 2 && rng.gen_bool(0.4) {
            EnemyKind::Lancer
        } else {
            EnemyKind::Drifter
        };
        spawn_enemy(state, kind, spawn_x, spawn_y, threat);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChunkCoord {
    x: i32,
    y: i32,
}

impl ChunkCoord {
    fn containing(x: f32, y: f32) -> Self {
        let span = CHUNK_SIZE as f32 * TILE_SIZE;
        Self {
            x: (x / span).floor() as i32,
            y: (y / span).floor() as i32,
        }
    }
}

#[derive(Debug, Clone)]
struct Chunk {
    tiles: Vec<u8>,
}

struct WorldNoise {
    biome: Perlin,
    structure: Perlin,
}

impl WorldNoise {
    fn new() -> Self {
        Self {
            biome: Perlin::new(BIOME_NOISE_SEED),
            structure: Perlin::new(STRUCTURE_NOISE_SEED),
        }
    }

    fn biome(&self, tile_x: f64, tile_y: f64) -> f64 {
        (self.biome.get([tile_x / 200.0, tile_y / 200.0]) + 1.0) / 2.0
    }

    fn structure(&self, tile_x: f64, tile_y: f64) -> f64 {
        (self.structure.get([tile_x / 30.0, tile_y / 30.0]) + 1.0) / 2.0
    }
}

struct World {
    noise: WorldNoise,
    chunks: HashMap<ChunkCoord, Chunk>,
    pending_broadcasts: Vec<ChunkCoord>,
}

impl World {
    fn new() -> Self {
        Self {
            noise: WorldNoise::new(),
            chunks: HashMap::new(),
            pending_broadcasts: Vec::new(),
        }
    }

    // Chunks are append-only: once generated, a chunk is never regenerated,
    // so the same coordinates always yield the same tiles.
    fn ensure_chunk(&mut self, coord: ChunkCoord) {
        if self.chunks.contains_key(&coord) {
            return;
        }
        let chunk = self.generate_chunk(coord);
        self.chunks.insert(coord, chunk);
        self.pending_broadcasts.push(coord);
    }

    fn generate_chunk(&self, coord: ChunkCoord) -> Chunk {
        let mut tiles = vec![TILE_FLOOR; (CHUNK_SIZE * CHUNK_SIZE) as usize];
        if coord.x == 0 && coord.y == 0 {
            for y in 0..CHUNK_SIZE {
                for x in 0..CHUNK_SIZE {
                    let tile = CITY_LAYOUT
                        .get(y as usize)
                        .map(|row| row[x as usize])
                        .unwrap_or(TILE_CITY_FLOOR);
                    tiles[(y * CHUNK_SIZE + x) as usize] = tile;
                }
            }
            return Chunk { tiles };
        }
        for y in 0..CHUNK_SIZE {
            for x in 0..CHUNK_SIZE {
                let tile_x = coord.x * CHUNK_SIZE + x;
                let tile_y = coord.y * CHUNK_SIZE + y;
                tiles[(y * CHUNK_SIZE + x) as usize] = self.synthesize_tile(tile_x, tile_y);
            }
        }
        Chunk { tiles }
    }

    fn synthesize_tile(&self, tile_x: i32, tile_y: i32) -> u8 {
        for (_, site_x, site_y) in BOSS_SITES {
            let dx = tile_x as f32 - site_x / TILE_SIZE;
            let dy = tile_y as f32 - site_y / TILE_SIZE;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist <= ARENA_WALL_INNER {
                return TILE_ARENA_FLOOR;
            }
            if dist <= ARENA_WALL_OUTER {
                return TILE_ARENA_WALL;
            }
        }
        let structure = self.noise.structure(tile_x as f64, tile_y as f64);
        if structure > 0.45 && structure < 0.55 {
            let biome = self.noise.biome(tile_x as f64, tile_y as f64);
            if biome < 0.4 {
                return TILE_FUNGAL_WALL;
            }
            return TILE_CRYSTAL_WALL;
        }
        TILE_FLOOR
    }

    fn tile_at(&mut self, x: f32, y: f32) -> u8 {
        let tile_x = (x / TILE_SIZE).floor() as i32;
        let tile_y = (y / TILE_SIZE).floor() as i32;
        let coord = ChunkCoord {
            x: tile_x.div_euclid(CHUNK_SIZE),
            y: tile_y.div_euclid(CHUNK_SIZE),
        };
        self.ensure_chunk(coord);
        let local_x = tile_x.rem_euclid(CHUNK_SIZE);
        let local_y = tile_y.rem_euclid(CHUNK_SIZE);
        self.chunks
            .get(&coord)
            .map(|chunk| chunk.tiles[(local_y * CHUNK_SIZE + local_x) as usize])
            .unwrap_or(TILE_VOID)
    }
}

fn is_city(x: f32, y: f32) -> bool {
    let coord = ChunkCoord::containing(x, y);
    coord.x == 0 && coord.y == 0
}

fn threat_level(x: f32, y: f32) -> u8 {
    if is_city(x, y) {
        return 0;
    }
    let dist_tiles = x.hypot(y) / TILE_SIZE;
    if dist_tiles < 100.0 {
        1
    } else if dist_tiles < 200.0 {
        2
    } else if dist_tiles < 300.0 {
        3
    } else if dist_tiles < 500.0 {
        4
    } else {
        5
    }
}

#[derive(Clone)]
struct GameStore {
    dir: PathBuf,
}

impl GameStore {
    fn new(dir: &str) -> Self {
        Self { dir: PathBuf::from(dir) }
    }

    async fn load_blob<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.dir.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!("corrupt blob {}: {}", name, err);
                    T::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(err) => {
                warn!("read {} failed: {}", name, err);
                T::default()
            }
        }
    }

    async fn save_blob<T: Serialize>(&self, name: &str, value: &T) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let payload = serde_json::to_vec_pretty(value)?;
        let tmp = self.dir.join(format!("{}.tmp", name));
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, self.dir.join(name)).await?;
        Ok(())
    }
}

fn generate_equipment(tier: u8, rng: &mut impl Rng) -> Item {
    let tier = tier.clamp(1, 5);
    let step = (tier - 1) as f32;
    let (slot, name, stats) = match rng.gen_range(0..3) {
        0 => (
            EquipSlot::Module,
            "Targeting Module",
            ItemStats {
                damage: Some(5.0 + step * 5.0),
                fire_rate: Some(0.5 + step * 0.5),
                ..ItemStats::default()
            },
        ),
        1 => (
            EquipSlot::Plating,
            "Hull Plating",
            ItemStats {
                max_health: Some(10.0 + step * 10.0),
                defense: Some(1.0 + step * 2.0),
                ..ItemStats::default()
            },
        ),
        _ => {
            if rng.gen_bool(0.5) {
                (
                    EquipSlot::Utility,
                    "Drive Coil",
                    ItemStats {
                        speed: Some(0.1 + step * 0.15),
                        energy_regen: Some(2.0 + step * 3.0),
                        ..ItemStats::default()
                    },
                )
            } else {
                (
                    EquipSlot::Utility,
                    "Capacitor Bank",
                    ItemStats {
                        max_energy: Some(20.0 + step * 15.0),
                        ..ItemStats::default()
                    },
                )
            }
        }
    };
    Item {
        id: new_item_id(),
        slot,
        tier,
        name: format!("T{} {}", tier, name),
        weapon_kind: None,
        stats,
    }
}

fn weapon_item(tier: u8, kind: WeaponKind, name: &str) -> Item {
    Item {
        id: new_item_id(),
        slot: EquipSlot::Weapon,
        tier,
        name: name.to_string(),
        weapon_kind: Some(kind),
        stats: ItemStats {
            damage: Some(4.0 * tier as f32),
            ..ItemStats::default()
        },
    }
}

fn module_item(tier: u8) -> Item {
    let step = (tier - 1) as f32;
    Item {
        id: new_item_id(),
        slot: EquipSlot::Module,
        tier,
        name: format!("T{} Targeting Module", tier),
        weapon_kind: None,
        stats: ItemStats {
            damage: Some(5.0 + step * 5.0),
            fire_rate: Some(0.5 + step * 0.5),
            ..ItemStats::default()
        },
    }
}

fn plating_item(tier: u8) -> Item {
    let step = (tier - 1) as f32;
    Item {
        id: new_item_id(),
        slot: EquipSlot::Plating,
        tier,
        name: format!("T{} Hull Plating", tier),
        weapon_kind: None,
        stats: ItemStats {
            max_health: Some(10.0 + step * 10.0),
            defense: Some(1.0 + step * 2.0),
            ..ItemStats::default()
        },
    }
}

fn utility_item(tier: u8) -> Item {
    let step = (tier - 1) as f32;
    Item {
        id: new_item_id(),
        slot: EquipSlot::Utility,
        tier,
        name: format!("T{} Drive Coil", tier),
        weapon_kind: None,
        stats: ItemStats {
            speed: Some(0.1 + step * 0.15),
            energy_regen: Some(2.0 + step * 3.0),
            ..ItemStats::default()
        },
    }
}

fn shop_catalog() -> Vec<ShopEntry> {
    vec![
        ShopEntry { cost: 75, item: weapon_item(1, WeaponKind::Emitter, "Pulse Emitter") },
        ShopEntry { cost: 50, item: plating_item(1) },
        ShopEntry { cost: 50, item: module_item(1) },
        ShopEntry { cost: 50, item: utility_item(1) },
        ShopEntry { cost: 200, item: weapon_item(1, WeaponKind::Scatter, "Scatter Array") },
        ShopEntry { cost: 225, item: weapon_item(1, WeaponKind::Beam, "Lance Beam") },
        ShopEntry { cost: 250, item: weapon_item(1, WeaponKind::Launcher, "Ordnance Launcher") },
        ShopEntry { cost: 350, item: module_item(2) },
    ]
}

struct GameState {
    players: HashMap<String, Player>,
    enemies: HashMap<u64, Enemy>,
    entities: Vec<Entity>,
    clients: HashMap<String, mpsc::UnboundedSender<ServerMessage>>,
    world: World,
    queued_commands: Vec<(String, ClientMessage)>,
    deferred: Vec<Deferred>,
    banks: HashMap<String, Vec<BankStack>>,
    market: MarketData,
    shop: Vec<ShopEntry>,
    boss_respawns: Vec<(EnemyKind, f32)>,
    enemy_spawn_timer: f32,
    next_entity_id: u64,
    banks_dirty: bool,
    market_dirty: bool,
}

impl GameState {
    fn new(banks: HashMap<String, Vec<BankStack>>, market: MarketData) -> Self {
        Self {
            players: HashMap::new(),
            enemies: HashMap::new(),
            entities: Vec::new(),
            clients: HashMap::new(),
            world: World::new(),
            queued_commands: Vec::new(),
            deferred: Vec::new(),
            banks,
            market,
            shop: shop_catalog(),
            boss_respawns: Vec::new(),
            enemy_spawn_timer: ENEMY_SPAWN_INTERVAL,
            next_entity_id: 1,
            banks_dirty: false,
            market_dirty: false,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct StatBlock {
    max_health: f32,
    max_energy: f32,
    defense: f32,
    speed: f32,
    fire_rate: f32,
    damage: f32,
    energy_regen: f32,
    health_regen: f32,
}

impl StatBlock {
    fn baseline() -> Self {
        Self {
            max_health: 100.0,
            max_energy: 300.0,
            defense: 0.0,
            speed: 4.0,
            fire_rate: 2.0,
            damage: 8.0,
            energy_regen: 25.0,
            health_regen: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PlayerClass {
    Phantom,
    Bulwark,
    Reaver,
}

impl PlayerClass {
    fn base_stats(self) -> StatBlock {
        let mut stats = StatBlock::baseline();
        match self {
            PlayerClass::Phantom => {
                stats.speed = 4.5;
                stats.max_health = 80.0;
            }
            PlayerClass::Bulwark => {
                stats.speed = 3.5;
                stats.max_health = 150.0;
            }
            PlayerClass::Reaver => {}
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EquipSlot {
    Weapon,
    Module,
    Plating,
    Utility,
}

impl EquipSlot {
    const ALL: [EquipSlot; 4] = [
        EquipSlot::Weapon,
        EquipSlot::Module,
        EquipSlot::Plating,
        EquipSlot::Utility,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WeaponKind {
    Emitter,
    Scatter,
    Beam,
    Launcher,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ItemStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    damage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fire_rate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_health: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    defense: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    energy_regen: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_energy: Option<f32>,
}

impl ItemStats {
    fn apply(&self, stats: &mut StatBlock) {
        if let Some(damage) = self.damage {
            stats.damage += damage;
        }
        if let Some(fire_rate) = self.fire_rate {
            stats.fire_rate += fire_rate;
        }
        if let Some(max_health) = self.max_health {
            stats.max_health += max_health;
        }
        if let Some(defense) = self.defense {
            stats.defense += defense;
        }
        if let Some(speed) = self.speed {
            stats.speed += speed;
        }
        if let Some(energy_regen) = self.energy_regen {
            stats.energy_regen += energy_regen;
        }
        if let Some(max_energy) = self.max_energy {
            stats.max_energy += max_energy;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Item {
    id: String,
    slot: EquipSlot,
    tier: u8,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weapon_kind: Option<WeaponKind>,
    stats: ItemStats,
}

impl Item {
    // Stacking identity: everything except the per-instance id.
    fn same_kind(&self, other: &Item) -> bool {
        self.name == other.name
            && self.tier == other.tier
            && self.slot == other.slot
            && self.weapon_kind == other.weapon_kind
            && self.stats == other.stats
    }
}

#[derive(Debug, Clone, Default, Serialize)]
struct Equipment {
    weapon: Option<Item>,
    module: Option<Item>,
    plating: Option<Item>,
    utility: Option<Item>,
}

impl Equipment {
    fn slot_mut(&mut self, slot: EquipSlot) -> &mut Option<Item> {
        match slot {
            EquipSlot::Weapon => &mut self.weapon,
            EquipSlot::Module => &mut self.module,
            EquipSlot::Plating => &mut self.plating,
            EquipSlot::Utility => &mut self.utility,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Option<Item>> {
        [&self.weapon, &self.module, &self.plating, &self.utility].into_iter()
    }
}

#[derive(Debug, Clone, Default)]
struct TradeState {
    partner_id: Option<String>,
    offer_items: Vec<String>,
    offer_credits: i64,
    accepted_stage1: bool,
    accepted_stage2: bool,
}

impl TradeState {
    fn with_partner(partner_id: &str) -> Self {
        Self {
            partner_id: Some(partner_id.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
struct InputState {
    up: bool,
    down: bool,
    left: bool,
    right: bool,
    fire: bool,
    melee: bool,
    boost: bool,
    ability: bool,
    interact: bool,
    teleport: bool,
}

#[derive(Debug)]
struct Player {
    id: String,
    username: String,
    color: String,
    class: PlayerClass,
    x: f32,
    y: f32,
    angle: f32,
    credits: i64,
    equipment: Equipment,
    inventory: Vec<Option<Item>>,
    level: i32,
    xp: i64,
    xp_to_next: i64,
    stats: StatBlock,
    health: f32,
    energy: f32,
    gun_cooldown: f32,
    melee_cooldown: f32,
    ability_cooldown: f32,
    teleport_cooldown: f32,
    teleport_timer: f32,
    is_teleporting: bool,
    is_slowed: bool,
    is_dead: bool,
    is_boosting: bool,
    can_boost: bool,
    time_since_last_hit: f32,
    is_invisible: bool,
    invis_timer: f32,
    shield_active: bool,
    shield_timer: f32,
    shield_health: f32,
    trade: TradeState,
    inputs: InputState,
}

impl Player {
    fn new(id: String, username: String, color: String, class: PlayerClass) -> Self {
        let stats = class.base_stats();
        Self {
            id,
            username,
            color,
            class,
            x: CITY_SPAWN.0,
            y: CITY_SPAWN.1,
            angle: 0.0,
            credits: 0,
            equipment: Equipment::default(),
            inventory: vec![None; INVENTORY_SLOTS],
            level: 1,
            xp: 0,
            xp_to_next: xp_for_level(1),
            stats,
            health: stats.max_health,
            energy: stats.max_energy,
            gun_cooldown: 0.0,
            melee_cooldown: 0.0,
            ability_cooldown: 0.0,
            teleport_cooldown: 0.0,
            teleport_timer: 0.0,
            is_teleporting: false,
            is_slowed: false,
            is_dead: false,
            is_boosting: false,
            can_boost: true,
            time_since_last_hit: 0.0,
            is_invisible: false,
            invis_timer: 0.0,
            shield_active: false,
            shield_timer: 0.0,
            shield_health: 0.0,
            trade: TradeState::default(),
            inputs: InputState::default(),
        }
    }

    fn recalculate_stats(&mut self) {
        let mut stats = self.class.base_stats();
        stats.max_health += (self.level - 1) as f32 * 5.0;
        stats.damage += (self.level - 1) as f32;
        for item in self.equipment.iter().flatten() {
            item.stats.apply(&mut stats);
        }
        self.stats = stats;
        self.health = self.health.min(stats.max_health);
        self.energy = self.energy.min(stats.max_energy);
    }

    // Death is permanent: everything resets to a fresh level-1 character.
    fn respawn(&mut self) {
        self.level = 1;
        self.xp = 0;
        self.xp_to_next = xp_for_level(1);
        self.credits = 0;
        self.equipment = Equipment::default();
        self.inventory = vec![None; INVENTORY_SLOTS];
        self.x = CITY_SPAWN.0;
        self.y = CITY_SPAWN.1;
        self.stats = self.class.base_stats();
        self.health = self.stats.max_health;
        self.energy = self.stats.max_energy;
        self.gun_cooldown = 0.0;
        self.melee_cooldown = 0.0;
        self.ability_cooldown = 0.0;
        self.teleport_cooldown = 0.0;
        self.teleport_timer = 0.0;
        self.is_teleporting = false;
        self.is_slowed = false;
        self.is_dead = false;
        self.is_boosting = false;
        self.can_boost = true;
        self.time_since_last_hit = 0.0;
        self.is_invisible = false;
        self.invis_timer = 0.0;
        self.shield_active = false;
        self.shield_timer = 0.0;
        self.shield_health = 0.0;
        self.trade = TradeState::default();
        self.inputs = InputState::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
enum EnemyKind {
    Drifter,
    Lancer,
    Swarmer,
    Custodian,
    Singularity,
    Colossus,
    LeviathanHead,
    LeviathanSegment,
    Augur,
    Stalker,
}

impl EnemyKind {
    fn is_boss(self) -> bool {
        matches!(
            self,
            EnemyKind::Colossus | EnemyKind::LeviathanHead | EnemyKind::Augur | EnemyKind::Stalker
        )
    }

    fn display_name(self) -> &'static str {
        match self {
            EnemyKind::Drifter => "Drifter",
            EnemyKind::Lancer => "Lancer",
            EnemyKind::Swarmer => "Void Swarmer",
            EnemyKind::Custodian => "Custodian",
            EnemyKind::Singularity => "Singularity",
            EnemyKind::Colossus => "The Colossus",
            EnemyKind::LeviathanHead => "The Leviathan",
            EnemyKind::LeviathanSegment => "Leviathan Segment",
            EnemyKind::Augur => "The Augur",
            EnemyKind::Stalker => "The Stalker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BossPhase {
    Idle,
    Barrage,
    Mortar,
    Summon,
}

#[derive(Debug)]
struct Enemy {
    id: u64,
    kind: EnemyKind,
    x: f32,
    y: f32,
    radius: f32,
    speed: f32,
    health: f32,
    max_health: f32,
    threat: u8,
    damage_mult: f32,
    aggro_radius: f32,
    wander_target: Option<(f32, f32)>,
    wander_timer: f32,
    shoot_cooldown: f32,
    ability_cooldown: f32,
    shield: f32,
    xp_value: i64,
    time_outside_range: f32,
    is_dead: bool,
    is_invisible: bool,
    spawn_x: f32,
    spawn_y: f32,
    leash_radius: f32,
    phase: BossPhase,
    phase_timer: f32,
    locked_target: Option<String>,
    segments: Vec<u64>,
    head_id: Option<u64>,
}

impl Enemy {
    fn new(id: u64, kind: EnemyKind, x: f32, y: f32, threat: u8) -> Self {
        let mut enemy = Self {
            id,
            kind,
            x,
            y,
            radius: 12.0,
            speed: 2.5,
            health: 50.0,
            max_health: 50.0,
            threat,
            damage_mult: 1.0,
            aggro_radius: 350.0,
            wander_target: None,
            wander_timer: 0.0,
            shoot_cooldown: 0.0,
            ability_cooldown: 0.0,
            shield: 0.0,
            xp_value: 15 * threat.max(1) as i64,
            time_outside_range: 0.0,
            is_dead: false,
            is_invisible: false,
            spawn_x: x,
            spawn_y: y,
            leash_radius: 2500.0,
            phase: BossPhase::Idle,
            phase_timer: 0.0,
            locked_target: None,
            segments: Vec::new(),
            head_id: None,
        };
        let threat_step = threat.max(1) as i64;
        match kind {
            EnemyKind::Drifter => {}
            EnemyKind::Lancer => {
                enemy.radius = 10.0;
                enemy.speed = 4.0;
                enemy.health = 40.0;
                enemy.shoot_cooldown = 1.6;
                enemy.xp_value = 20 * threat_step;
            }
            EnemyKind::Swarmer => {
                enemy.radius = 8.0;
                enemy.speed = 5.0;
                enemy.health = 25.0;
                enemy.xp_value = 12 * threat_step;
            }
            EnemyKind::Custodian => {
                enemy.radius = 18.0;
                enemy.speed = 1.8;
                enemy.health = 250.0;
                enemy.shield = 100.0;
                enemy.ability_cooldown = 5.0;
                enemy.xp_value = 60 * threat_step;
            }
            EnemyKind::Singularity => {
                enemy.radius = 20.0;
                enemy.speed = 0.0;
                enemy.health = 999_999.0;
                enemy.xp_value = 0;
            }
            EnemyKind::Colossus => {
                enemy.radius = 80.0;
                enemy.speed = 2.5;
                enemy.health = 15_000.0;
                enemy.aggro_radius = 1500.0;
                enemy.xp_value = BOSS_XP_REWARD;
                enemy.phase_timer = 3.0;
            }
            EnemyKind::LeviathanHead => {
                enemy.radius = 30.0;
                enemy.speed = 3.5;
                enemy.health = 12_000.0;
                enemy.aggro_radius = 1200.0;
                enemy.xp_value = BOSS_XP_REWARD;
            }
            EnemyKind::LeviathanSegment => {
                enemy.radius = 25.0;
                enemy.speed = 0.0;
                enemy.health = 2_000.0;
                enemy.xp_value = 250;
                enemy.shoot_cooldown = 2.0;
            }
            EnemyKind::Augur => {
                enemy.radius = 40.0;
                enemy.speed = 0.0;
                enemy.health = 10_000.0;
                enemy.aggro_radius = 1200.0;
                enemy.xp_value = BOSS_XP_REWARD;
                enemy.phase_timer = 3.5;
            }
            EnemyKind::Stalker => {
                enemy.radius = 25.0;
                enemy.speed = 3.2;
                enemy.health = 20_000.0;
                enemy.aggro_radius = 1500.0;
                enemy.xp_value = BOSS_XP_REWARD;
                enemy.is_invisible = true;
                enemy.phase_timer = 3.0;
            }
        }
        if matches!(
            kind,
            EnemyKind::Drifter | EnemyKind::Lancer | EnemyKind::Swarmer | EnemyKind::Custodian
        ) {
            enemy.apply_threat();
        }
        enemy.max_health = enemy.health;
        enemy
    }

    fn apply_threat(&mut self) {
        let steps = self.threat.saturating_sub(1) as f32;
        self.health *= 1.0 + steps * THREAT_HEALTH_STEP;
        self.damage_mult = 1.0 + steps * THREAT_DAMAGE_STEP;
    }

    fn damage_source(&self) -> DamageSource {
        DamageSource {
            player_id: None,
            name: self.kind.display_name().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct DamageSource {
    player_id: Option<String>,
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum StationKind {
    Exchange,
    Bank,
    Medbay,
    Console,
    Portal,
}

#[derive(Debug)]
struct Entity {
    id: u64,
    x: f32,
    y: f32,
    radius: f32,
    life: f32,
    color: String,
    source: Option<DamageSource>,
    is_dead: bool,
    kind: EntityKind,
}

#[derive(Debug)]
enum EntityKind {
    Projectile {
        angle: f32,
        speed: f32,
        damage: f32,
        ordnance: bool,
        blast_radius: f32,
    },
    Mortar {
        damage: f32,
        blast_radius: f32,
    },
    Beam {
        angle: f32,
        length: f32,
        damage: f32,
    },
    MeleeArc {
        angle: f32,
        arc: f32,
        damage: f32,
        hit_enemies: Vec<u64>,
    },
    Shockwave {
        max_radius: f32,
        damage: f32,
        hit_players: HashSet<String>,
        hit_enemies: HashSet<u64>,
    },
    FloatingText {
        text: String,
    },
    CreditDrop {
        value: i64,
    },
    EquipmentDrop {
        item: Item,
        pickup_delay: f32,
    },
    LootBag {
        items: Vec<Option<Item>>,
        credits: i64,
        pickup_delay: f32,
    },
    GraveMarker {
        username: String,
        cause: String,
        loot_bag: Option<u64>,
    },
    Station {
        station: StationKind,
        name: String,
    },
}

#[derive(Debug, Clone)]
struct Deferred {
    delay: f32,
    action: DeferredAction,
}

#[derive(Debug, Clone)]
enum DeferredAction {
    BossShot {
        enemy_id: u64,
        target_id: String,
        damage: f32,
        spread: f32,
        speed: f32,
        life: f32,
        radius: f32,
    },
    StalkerBurst {
        enemy_id: u64,
    },
    StalkerRecloak {
        enemy_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BankStack {
    item: Item,
    quantity: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ShopEntry {
    item: Item,
    cost: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarketListing {
    id: u64,
    seller: String,
    item: Item,
    price: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MarketData {
    listings: Vec<MarketListing>,
    payouts: HashMap<String, i64>,
    next_listing_id: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BankOp {
    Deposit,
    Withdraw,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BankAmount {
    All,
    #[serde(untagged)]
    Count(u32),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Join { class: PlayerClass, username: String, color: String },
    Input { inputs: InputState, angle: f32 },
    Respawn,
    Chat { text: String },
    PickupLoot { entity_id: u64, item_index: Option<usize> },
    EquipItem { slot_index: usize },
    UnequipItem { slot: EquipSlot },
    DropItem { slot_index: usize },
    DropEquipped { slot: EquipSlot },
    BuyShopItem { entry_index: usize },
    SellItem { slot_index: usize },
    BankAction { action: BankOp, index: usize, amount: BankAmount },
    MarketList { slot_index: usize, price: i64 },
    MarketBuy { listing_id: u64 },
    TradeRequest { target_id: String },
    TradeResponse { requester_id: String, accepted: bool },
    TradeOffer { item_ids: Vec<String>, credits: i64 },
    TradeAcceptStage1,
    TradeAcceptStage2,
    TradeCancel,
}

#[derive(Debug, Clone, Serialize)]
struct ChunkPayload {
    chunk_x: i32,
    chunk_y: i32,
    tiles: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
struct TradeSummary {
    items: Vec<Item>,
    credits: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Init { player_id: String, chunks: Vec<ChunkPayload> },
    ChunkData { chunk_x: i32, chunk_y: i32, tiles: Vec<u8> },
    Update {
        players: HashMap<String, PlayerPublic>,
        enemies: Vec<EnemyPublic>,
        entities: Vec<EntityPublic>,
    },
    Chat { sender: String, text: String, color: String },
    Sfx { effect: String, x: f32, y: f32, color: String },
    PlayerDied { cause: String },
    OpenBank { stacks: Vec<BankStack> },
    OpenShop { name: String, entries: Vec<ShopEntry>, listings: Vec<MarketListing> },
    TradeRequest { from: PlayerPublic },
    TradeStarted { partner: PlayerPublic },
    TradeOfferUpdate { items: Vec<Item>, credits: i64 },
    TradeStatus { you_accepted: bool, partner_accepted: bool },
    TradeConfirm { your_offer: TradeSummary, partner_offer: TradeSummary },
    TradeCancelled { reason: String },
    TradeCompleted,
}

#[derive(Debug, Clone, Serialize)]
struct PlayerPublic {
    id: String,
    username: String,
    color: String,
    class: PlayerClass,
    x: f32,
    y: f32,
    angle: f32,
    radius: f32,
    health: f32,
    energy: f32,
    stats: StatBlock,
    level: i32,
    xp: i64,
    xp_to_next: i64,
    credits: i64,
    inventory: Vec<Option<Item>>,
    equipment: Equipment,
    gun_cooldown: f32,
    melee_cooldown: f32,
    ability_cooldown: f32,
    teleport_cooldown: f32,
    teleport_timer: f32,
    is_dead: bool,
    is_invisible: bool,
    is_boosting: bool,
    is_teleporting: bool,
    shield_active: bool,
    shield_health: f32,
    trade_partner: Option<String>,
}

impl From<&Player> for PlayerPublic {
    fn from(player: &Player) -> Self {
        Self {
            id: player.id.clone(),
            username: player.username.clone(),
            color: player.color.clone(),
            class: player.class,
            x: player.x,
            y: player.y,
            angle: player.angle,
            radius: PLAYER_RADIUS,
            health: player.health,
            energy: player.energy,
            stats: player.stats,
            level: player.level,
            xp: player.xp,
            xp_to_next: player.xp_to_next,
            credits: player.credits,
            inventory: player.inventory.clone(),
            equipment: player.equipment.clone(),
            gun_cooldown: player.gun_cooldown,
            melee_cooldown: player.melee_cooldown,
            ability_cooldown: player.ability_cooldown,
            teleport_cooldown: player.teleport_cooldown,
            teleport_timer: player.teleport_timer,
            is_dead: player.is_dead,
            is_invisible: player.is_invisible,
            is_boosting: player.is_boosting,
            is_teleporting: player.is_teleporting,
            shield_active: player.shield_active,
            shield_health: player.shield_health,
            trade_partner: player.trade.partner_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct EnemyPublic {
    id: u64,
    kind: EnemyKind,
    x: f32,
    y: f32,
    radius: f32,
    health: f32,
    max_health: f32,
    threat: u8,
    shield: f32,
    is_invisible: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    segments: Vec<EnemyPublic>,
}

fn enemy_snapshot(enemy: &Enemy, enemies: &HashMap<u64, Enemy>) -> EnemyPublic {
    let segments = enemy
        .segments
        .iter()
        .filter_map(|id| enemies.get(id))
        .filter(|segment| !segment.is_dead)
        .map(|segment| enemy_snapshot(segment, enemies))
        .collect();
    EnemyPublic {
        id: enemy.id,
        kind: enemy.kind,
        x: enemy.x,
        y: enemy.y,
        radius: enemy.radius,
        health: enemy.health,
        max_health: enemy.max_health,
        threat: enemy.threat,
        shield: enemy.shield,
        is_invisible: enemy.is_invisible,
        segments,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EntityView {
    Projectile { angle: f32 },
    Mortar,
    Beam { angle: f32, length: f32 },
    MeleeArc { angle: f32, arc: f32 },
    Shockwave { max_radius: f32 },
    FloatingText { text: String },
    CreditDrop { value: i64 },
    EquipmentDrop { item: Item, pickup_delay: f32 },
    LootBag { items: Vec<Option<Item>>, credits: i64, pickup_delay: f32 },
    GraveMarker { username: String, cause: String, loot_bag: Option<u64> },
    Station { station: StationKind, name: String },
}

#[derive(Debug, Clone, Serialize)]
struct EntityPublic {
    id: u64,
    x: f32,
    y: f32,
    radius: f32,
    color: String,
    #[serde(flatten)]
    view: EntityView,
}

impl From<&Entity> for EntityPublic {
    fn from(entity: &Entity) -> Self {
        let view = match &entity.kind {
            EntityKind::Projectile { angle, .. } => EntityView::Projectile { angle: *angle },
            EntityKind::Mortar { .. } => EntityView::Mortar,
            EntityKind::Beam { angle, length, .. } => {
                EntityView::Beam { angle: *angle, length: *length }
            }
            EntityKind::MeleeArc { angle, arc, .. } => {
                EntityView::MeleeArc { angle: *angle, arc: *arc }
            }
            EntityKind::Shockwave { max_radius, .. } => {
                EntityView::Shockwave { max_radius: *max_radius }
            }
            EntityKind::FloatingText { text } => EntityView::FloatingText { text: text.clone() },
            EntityKind::CreditDrop { value } => EntityView::CreditDrop { value: *value },
            EntityKind::EquipmentDrop { item, pickup_delay } => EntityView::EquipmentDrop {
                item: item.clone(),
                pickup_delay: *pickup_delay,
            },
            EntityKind::LootBag { items, credits, pickup_delay } => EntityView::LootBag {
                items: items.clone(),
                credits: *credits,
                pickup_delay: *pickup_delay,
            },
            EntityKind::GraveMarker { username, cause, loot_bag } => EntityView::GraveMarker {
                username: username.clone(),
                cause: cause.clone(),
                loot_bag: *loot_bag,
            },
            EntityKind::Station { station, name } => EntityView::Station {
                station: *station,
                name: name.clone(),
            },
        };
        Self {
            id: entity.id,
            x: entity.x,
            y: entity.y,
            radius: entity.radius,
            color: entity.color.clone(),
            view,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> GameState {
        GameState::new(HashMap::new(), MarketData::default())
    }

    fn add_player(state: &mut GameState, id: &str, class: PlayerClass) {
        let player = Player::new(id.to_string(), id.to_string(), "#ffffff".to_string(), class);
        state.players.insert(id.to_string(), player);
    }

    fn player_source(id: &str) -> DamageSource {
        DamageSource { player_id: Some(id.to_string()), name: id.to_string() }
    }

    fn push_projectile(state: &mut GameState, x: f32, y: f32, damage: f32, source: DamageSource) {
        let id = state.next_id();
        state.entities.push(Entity {
            id,
            x,
            y,
            radius: 4.0,
            life: 1.0,
            color: "#ffffff".to_string(),
            source: Some(source),
            is_dead: false,
            kind: EntityKind::Projectile {
                angle: 0.0,
                speed: 0.0,
                damage,
                ordnance: false,
                blast_radius: 0.0,
            },
        });
    }

    fn loot_bag_count(state: &GameState) -> usize {
        state
            .entities
            .iter()
            .filter(|entity| matches!(entity.kind, EntityKind::LootBag { .. }))
            .count()
    }

    #[test]
    fn same_coordinates_always_yield_same_tiles() {
        let mut world = World::new();
        let first = world.tile_at(12_345.0, -6_789.0);
        let chunk_count = world.chunks.len();
        let second = world.tile_at(12_345.0, -6_789.0);
        assert_eq!(first, second);
        assert_eq!(world.chunks.len(), chunk_count);

        let coord = ChunkCoord { x: 7, y: -3 };
        let once = world.generate_chunk(coord);
        let twice = world.generate_chunk(coord);
        assert_eq!(once.tiles, twice.tiles);
    }

    #[test]
    fn wall_tiles_block_and_doors_do_not() {
        assert!(is_solid(TILE_CITY_WALL));
        assert!(is_solid(TILE_FUNGAL_WALL));
        assert!(is_solid(TILE_CRYSTAL_WALL));
        assert!(is_solid(TILE_ARENA_WALL));
        assert!(!is_solid(TILE_DOOR));
        assert!(!is_solid(TILE_CITY_FLOOR));
        assert!(!is_solid(TILE_FLOOR));
        assert!(!is_solid(TILE_ARENA_FLOOR));
        assert!(!is_solid(TILE_VOID));
    }

    #[test]
    fn origin_chunk_is_the_city() {
        assert!(is_city(CITY_SPAWN.0, CITY_SPAWN.1));
        assert!(!is_city(-1.0, -1.0));
        assert!(!is_city(CHUNK_SIZE as f32 * TILE_SIZE + 1.0, 0.0));
        assert_eq!(threat_level(CITY_SPAWN.0, CITY_SPAWN.1), 0);
    }

    #[test]
    fn threat_rings_scale_with_distance_from_origin() {
        assert_eq!(threat_level(50.0 * TILE_SIZE, 0.0), 1);
        assert_eq!(threat_level(150.0 * TILE_SIZE, 0.0), 2);
        assert_eq!(threat_level(250.0 * TILE_SIZE, 0.0), 3);
        assert_eq!(threat_level(400.0 * TILE_SIZE, 0.0), 4);
        assert_eq!(threat_level(600.0 * TILE_SIZE, 0.0), 5);
    }

    #[test]
    fn players_inside_the_city_ignore_player_sourced_damage() {
        let mut state = test_state();
        add_player(&mut state, "attacker", PlayerClass::Reaver);
        add_player(&mut state, "victim", PlayerClass::Reaver);
        let max_health = state.players["victim"].stats.max_health;

        push_projectile(
            &mut state,
            CITY_SPAWN.0,
            CITY_SPAWN.1,
            50.0,
            player_source("attacker"),
        );
        resolve_collisions(&mut state, 0.033);
        assert_eq!(state.players["victim"].health, max_health);

        // outside the city the same shot lands
        let outside = CHUNK_SIZE as f32 * TILE_SIZE * 3.0;
        if let Some(victim) = state.players.get_mut("victim") {
            victim.x = outside;
            victim.y = outside;
        }
        push_projectile(&mut state, outside, outside, 50.0, player_source("attacker"));
        resolve_collisions(&mut state, 0.033);
        assert!(state.players["victim"].health < max_health);
    }

    #[test]
    fn defense_reduces_damage_with_a_floor_of_one() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let max_health = {
            let player = state.players.get_mut("p1").unwrap();
            player.stats.defense = 3.0;
            player.stats.max_health
        };
        damage_player(&mut state, "p1", 10.0, &player_source("x"));
        assert_eq!(state.players["p1"].health, max_health - 7.0);

        // damage below defense still chips at least one point
        let before = state.players["p1"].health;
        damage_player(&mut state, "p1", 2.0, &player_source("x"));
        assert_eq!(state.players["p1"].health, before - 1.0);
    }

    #[test]
    fn player_death_is_idempotent() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        if let Some(player) = state.players.get_mut("p1") {
            player.credits = 100;
            player.inventory[0] = Some(module_item(1));
        }
        let source = DamageSource { player_id: None, name: "Drifter".to_string() };
        damage_player(&mut state, "p1", 10_000.0, &source);
        damage_player(&mut state, "p1", 10_000.0, &source);
        kill_player(&mut state, "p1", &source);

        assert!(state.players["p1"].is_dead);
        assert_eq!(loot_bag_count(&state), 1);
        let markers = state
            .entities
            .iter()
            .filter(|entity| matches!(entity.kind, EntityKind::GraveMarker { .. }))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn damage_interrupts_a_charging_recall() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        if let Some(player) = state.players.get_mut("p1") {
            player.is_teleporting = true;
            player.teleport_timer = 2.0;
        }
        damage_player(&mut state, "p1", 5.0, &player_source("x"));
        assert!(!state.players["p1"].is_teleporting);
    }

    #[test]
    fn threat_scaling_multiplies_health_and_damage() {
        let enemy = Enemy::new(1, EnemyKind::Drifter, 0.0, 0.0, 3);
        assert!((enemy.max_health - 110.0).abs() < 0.001);
        assert!((enemy.damage_mult - 1.8).abs() < 0.001);

        let mut raw = Enemy::new(2, EnemyKind::Drifter, 0.0, 0.0, 1);
        raw.health = 100.0;
        raw.threat = 3;
        raw.apply_threat();
        assert!((raw.health - 220.0).abs() < 0.001);
    }

    #[test]
    fn bulwark_shield_absorbs_before_health() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Bulwark);
        let max_health = {
            let player = state.players.get_mut("p1").unwrap();
            player.shield_active = true;
            player.shield_health = 100.0;
            player.shield_timer = 5.0;
            player.stats.max_health
        };
        damage_player(&mut state, "p1", 40.0, &player_source("x"));
        assert_eq!(state.players["p1"].health, max_health);
        assert_eq!(state.players["p1"].shield_health, 60.0);

        // overflow passes through to health
        damage_player(&mut state, "p1", 100.0, &player_source("x"));
        assert!(!state.players["p1"].shield_active);
        assert_eq!(state.players["p1"].health, max_health - 40.0);
    }

    #[test]
    fn leviathan_head_resists_damage_while_segments_live() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        spawn_boss(&mut state, EnemyKind::LeviathanHead, 0.0, 0.0);
        let head_id = *state
            .enemies
            .iter()
            .find(|(_, enemy)| enemy.kind == EnemyKind::LeviathanHead)
            .map(|(id, _)| id)
            .unwrap();
        let max_health = state.enemies[&head_id].max_health;

        damage_enemy(&mut state, head_id, 100.0, &player_source("p1"));
        assert!((state.enemies[&head_id].health - (max_health - 10.0)).abs() < 0.001);

        let segment_ids = state.enemies[&head_id].segments.clone();
        for id in segment_ids {
            if let Some(segment) = state.enemies.get_mut(&id) {
                segment.is_dead = true;
            }
        }
        damage_enemy(&mut state, head_id, 100.0, &player_source("p1"));
        assert!((state.enemies[&head_id].health - (max_health - 110.0)).abs() < 0.001);
    }

    #[test]
    fn melee_arc_only_hits_in_front() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        if let Some(player) = state.players.get_mut("p1") {
            player.x = 0.0;
            player.y = 0.0;
        }
        let ahead = spawn_enemy(&mut state, EnemyKind::Drifter, 40.0, 0.0, 1);
        let behind = spawn_enemy(&mut state, EnemyKind::Drifter, -40.0, 0.0, 1);

        let id = state.next_id();
        state.entities.push(Entity {
            id,
            x: 0.0,
            y: 0.0,
            radius: MELEE_RADIUS,
            life: 0.2,
            color: "#ffffff".to_string(),
            source: Some(player_source("p1")),
            is_dead: false,
            kind: EntityKind::MeleeArc {
                angle: 0.0,
                arc: std::f32::consts::FRAC_PI_2,
                damage: 12.0,
                hit_enemies: Vec::new(),
            },
        });
        resolve_collisions(&mut state, 0.033);

        assert!(state.enemies[&ahead].health < state.enemies[&ahead].max_health);
        assert_eq!(state.enemies[&behind].health, state.enemies[&behind].max_health);
    }

    #[test]
    fn shockwave_hits_each_target_once() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let target = spawn_enemy(&mut state, EnemyKind::Drifter, 30.0, 0.0, 1);
        let max_health = state.enemies[&target].max_health;

        let id = state.next_id();
        state.entities.push(Entity {
            id,
            x: 0.0,
            y: 0.0,
            radius: 100.0,
            life: 0.5,
            color: "#ffffff".to_string(),
            source: Some(player_source("p1")),
            is_dead: false,
            kind: EntityKind::Shockwave {
                max_radius: 100.0,
                damage: 10.0,
                hit_players: HashSet::new(),
                hit_enemies: HashSet::new(),
            },
        });
        resolve_collisions(&mut state, 0.033);
        resolve_collisions(&mut state, 0.033);
        assert_eq!(state.enemies[&target].health, max_health - 10.0);
    }

    #[test]
    fn expired_deferred_shots_check_liveness_first() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let enemy_id = spawn_enemy(&mut state, EnemyKind::Colossus, 0.0, 0.0, 5);
        if let Some(enemy) = state.enemies.get_mut(&enemy_id) {
            enemy.is_dead = true;
        }
        state.deferred.push(Deferred {
            delay: 0.01,
            action: DeferredAction::BossShot {
                enemy_id,
                target_id: "p1".to_string(),
                damage: 80.0,
                spread: 0.15,
                speed: 15.0,
                life: 1.5,
                radius: 10.0,
            },
        });
        run_deferred(&mut state, 0.05);
        assert!(state.entities.is_empty());
        assert!(state.deferred.is_empty());
    }

    #[test]
    fn purchases_without_credits_change_nothing() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        buy_shop_item(&mut state, "p1", 0);
        let player = &state.players["p1"];
        assert_eq!(player.credits, 0);
        assert!(player.inventory.iter().all(|slot| slot.is_none()));
    }

    #[test]
    fn purchases_with_credits_deduct_and_deliver() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        if let Some(player) = state.players.get_mut("p1") {
            player.credits = 100;
        }
        buy_shop_item(&mut state, "p1", 0);
        let player = &state.players["p1"];
        assert_eq!(player.credits, 25);
        assert!(player.inventory[0].is_some());
    }

    #[test]
    fn completed_trade_moves_items_and_credits_atomically() {
        let mut state = test_state();
        add_player(&mut state, "a", PlayerClass::Reaver);
        add_player(&mut state, "b", PlayerClass::Reaver);
        let item = module_item(2);
        let item_id = item.id.clone();
        if let Some(a) = state.players.get_mut("a") {
            a.credits = 50;
            a.inventory[0] = Some(item);
        }
        if let Some(b) = state.players.get_mut("b") {
            b.credits = 100;
        }

        start_trade(&mut state, "a", "b");
        trade_offer(&mut state, "a", vec![item_id.clone()], 10);
        trade_offer(&mut state, "b", Vec::new(), 25);
        trade_accept_stage1(&mut state, "a");
        trade_accept_stage1(&mut state, "b");
        trade_accept_stage2(&mut state, "a");
        trade_accept_stage2(&mut state, "b");

        let a = &state.players["a"];
        let b = &state.players["b"];
        assert_eq!(a.credits, 65);
        assert_eq!(b.credits, 85);
        assert!(a.inventory.iter().all(|slot| slot.is_none()));
        assert!(b
            .inventory
            .iter()
            .flatten()
            .any(|item| item.id == item_id));
        assert!(a.trade.partner_id.is_none());
        assert!(b.trade.partner_id.is_none());
    }

    #[test]
    fn trade_into_full_inventories_aborts_without_changes() {
        let mut state = test_state();
        add_player(&mut state, "a", PlayerClass::Reaver);
        add_player(&mut state, "b", PlayerClass::Reaver);
        for sid in ["a", "b"] {
            if let Some(player) = state.players.get_mut(sid) {
                for slot in player.inventory.iter_mut() {
                    *slot = Some(plating_item(1));
                }
                player.credits = 10;
            }
        }
        let a_offer = state.players["a"].inventory[0].as_ref().unwrap().id.clone();
        let b_offer = state.players["b"].inventory[0].as_ref().unwrap().id.clone();
        let a_before = state.players["a"].inventory.clone();
        let b_before = state.players["b"].inventory.clone();

        start_trade(&mut state, "a", "b");
        trade_offer(&mut state, "a", vec![a_offer], 0);
        trade_offer(&mut state, "b", vec![b_offer], 0);
        trade_accept_stage1(&mut state, "a");
        trade_accept_stage1(&mut state, "b");
        trade_accept_stage2(&mut state, "a");
        trade_accept_stage2(&mut state, "b");

        assert_eq!(state.players["a"].inventory, a_before);
        assert_eq!(state.players["b"].inventory, b_before);
        assert_eq!(state.players["a"].credits, 10);
        assert_eq!(state.players["b"].credits, 10);
        assert!(state.players["a"].trade.partner_id.is_none());
        assert!(state.players["b"].trade.partner_id.is_none());
    }

    #[test]
    fn damage_cancels_an_open_trade() {
        let mut state = test_state();
        add_player(&mut state, "a", PlayerClass::Reaver);
        add_player(&mut state, "b", PlayerClass::Reaver);
        start_trade(&mut state, "a", "b");
        assert!(state.players["a"].trade.partner_id.is_some());

        damage_player(&mut state, "a", 5.0, &player_source("x"));
        assert!(state.players["a"].trade.partner_id.is_none());
        assert!(state.players["b"].trade.partner_id.is_none());
    }

    #[test]
    fn changing_an_offer_resets_both_confirmations() {
        let mut state = test_state();
        add_player(&mut state, "a", PlayerClass::Reaver);
        add_player(&mut state, "b", PlayerClass::Reaver);
        start_trade(&mut state, "a", "b");
        trade_accept_stage1(&mut state, "a");
        trade_accept_stage1(&mut state, "b");
        assert!(state.players["a"].trade.accepted_stage1);
        assert!(state.players["b"].trade.accepted_stage1);

        trade_offer(&mut state, "a", Vec::new(), 5);
        assert!(!state.players["a"].trade.accepted_stage1);
        assert!(!state.players["b"].trade.accepted_stage1);
    }

    #[test]
    fn bank_deposits_stack_and_withdrawals_respect_space() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let sample = plating_item(1);
        if let Some(player) = state.players.get_mut("p1") {
            for slot in player.inventory.iter_mut().take(3) {
                let mut copy = sample.clone();
                copy.id = new_item_id();
                *slot = Some(copy);
            }
            player.inventory[3] = Some(module_item(1));
        }

        bank_action(&mut state, "p1", BankOp::Deposit, 0, BankAmount::All);
        {
            let bank = &state.banks["p1"];
            assert_eq!(bank.len(), 1);
            assert_eq!(bank[0].quantity, 3);
        }
        assert_eq!(free_slots(&state.players["p1"]), INVENTORY_SLOTS - 1);

        bank_action(&mut state, "p1", BankOp::Withdraw, 0, BankAmount::Count(2));
        {
            let bank = &state.banks["p1"];
            assert_eq!(bank[0].quantity, 1);
        }
        assert_eq!(free_slots(&state.players["p1"]), INVENTORY_SLOTS - 3);

        // a full inventory blocks withdrawal entirely
        if let Some(player) = state.players.get_mut("p1") {
            for slot in player.inventory.iter_mut() {
                if slot.is_none() {
                    *slot = Some(utility_item(1));
                }
            }
        }
        bank_action(&mut state, "p1", BankOp::Withdraw, 0, BankAmount::All);
        assert_eq!(state.banks["p1"][0].quantity, 1);
    }

    #[test]
    fn blink_refuses_to_enter_walls() {
        let mut state = test_state();
        state.world.ensure_chunk(ChunkCoord { x: 0, y: 0 });
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let mut player = state.players.remove("p1").unwrap();

        // facing the north city wall from just inside it
        player.x = 20.0;
        player.y = 160.0;
        player.angle = -std::f32::consts::FRAC_PI_2;
        use_ability(&mut player, &mut state);
        assert_eq!((player.x, player.y), (20.0, 160.0));
        assert_eq!(player.ability_cooldown, 0.0);

        // open floor ahead
        player.x = CITY_SPAWN.0;
        player.y = CITY_SPAWN.1;
        player.angle = 0.0;
        use_ability(&mut player, &mut state);
        assert_eq!(player.x, CITY_SPAWN.0 + 150.0);
        assert_eq!(player.ability_cooldown, 6.0);
        state.players.insert("p1".to_string(), player);
    }

    #[test]
    fn loot_bags_empty_out_and_expire() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let bag_id = state.next_id();
        let (x, y) = {
            let player = &state.players["p1"];
            (player.x, player.y)
        };
        state.entities.push(Entity {
            id: bag_id,
            x,
            y,
            radius: 12.0,
            life: 180.0,
            color: "#d4b106".to_string(),
            source: None,
            is_dead: false,
            kind: EntityKind::LootBag { items: Vec::new(), credits: 50, pickup_delay: 0.0 },
        });
        pickup_loot(&mut state, "p1", bag_id, None);
        assert_eq!(state.players["p1"].credits, 50);
        assert!(state.entities.iter().any(|entity| entity.id == bag_id && entity.is_dead));
    }

    #[test]
    fn xp_curve_and_level_ups() {
        assert_eq!(xp_for_level(1), 100);
        assert_eq!(xp_for_level(2), 114);

        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        let base_max = state.players["p1"].stats.max_health;
        grant_xp(&mut state, "p1", 100);
        let player = &state.players["p1"];
        assert_eq!(player.level, 2);
        assert_eq!(player.stats.max_health, base_max + 5.0);
        assert_eq!(player.health, player.stats.max_health);
    }

    #[test]
    fn singularity_pull_stops_at_walls_and_spares_charging_recalls() {
        let mut state = test_state();
        state.world.ensure_chunk(ChunkCoord { x: 0, y: 0 });
        add_player(&mut state, "p1", PlayerClass::Reaver);
        if let Some(player) = state.players.get_mut("p1") {
            player.x = 100.0;
            player.y = 50.0;
        }
        spawn_enemy(&mut state, EnemyKind::Singularity, 100.0, -150.0, 5);

        // the north city wall sits between the player and the well
        for _ in 0..5 {
            update_enemies(&mut state, 0.033);
        }
        let (px, py) = {
            let player = &state.players["p1"];
            (player.x, player.y)
        };
        assert_eq!((px, py), (100.0, 50.0));
        assert!(!is_solid(state.world.tile_at(px, py)));

        // a charging recall is not dragged at all, even over open floor
        if let Some(player) = state.players.get_mut("p1") {
            player.y = 100.0;
            player.is_teleporting = true;
        }
        update_enemies(&mut state, 0.033);
        assert_eq!(state.players["p1"].y, 100.0);
    }

    #[test]
    fn shockwaves_from_enemy_fire_still_hit_enemies() {
        let mut state = test_state();
        let target = spawn_enemy(&mut state, EnemyKind::Drifter, 30.0, 0.0, 1);
        let max_health = state.enemies[&target].max_health;

        let id = state.next_id();
        state.entities.push(Entity {
            id,
            x: 0.0,
            y: 0.0,
            radius: 100.0,
            life: 0.5,
            color: "#ff3300".to_string(),
            source: Some(DamageSource { player_id: None, name: "The Colossus".to_string() }),
            is_dead: false,
            kind: EntityKind::Shockwave {
                max_radius: 100.0,
                damage: 40.0,
                hit_players: HashSet::new(),
                hit_enemies: HashSet::new(),
            },
        });
        resolve_collisions(&mut state, 0.033);
        assert_eq!(state.enemies[&target].health, max_health - 40.0);
    }

    #[test]
    fn diagonal_steps_cannot_slip_into_the_city() {
        let mut state = test_state();
        state.world.ensure_chunk(ChunkCoord { x: 0, y: 0 });

        // just east of the city, aimed down-left so only the x axis crosses in
        let mut enemy = Enemy::new(1, EnemyKind::Drifter, 641.0, 637.5, 1);
        let speed = enemy.speed;
        step_towards(&mut enemy, &mut state, 500.0, 900.0, speed, 0.033);
        assert!(enemy.x >= 640.0);
        assert!(!is_city(enemy.x, enemy.y));

        // knockback is clamped the same way
        let id = spawn_enemy(&mut state, EnemyKind::Drifter, 320.0, 645.0, 1);
        knockback_enemy(&mut state, id, -std::f32::consts::FRAC_PI_2, 15.0);
        assert_eq!(state.enemies[&id].y, 645.0);
    }

    #[test]
    fn lone_enemies_persist_while_nobody_is_connected() {
        let mut state = test_state();
        let id = spawn_enemy(&mut state, EnemyKind::Drifter, 5000.0, 5000.0, 1);
        for _ in 0..10 {
            update_lifecycle(&mut state, DESPAWN_TIME);
        }
        assert!(!state.enemies[&id].is_dead);
        assert_eq!(state.enemies[&id].time_outside_range, 0.0);

        // with a player connected far away, the despawn clock runs again
        add_player(&mut state, "p1", PlayerClass::Reaver);
        update_lifecycle(&mut state, DESPAWN_TIME + 1.0);
        assert!(state.enemies[&id].is_dead);
    }

    #[test]
    fn death_drops_the_credit_fraction_behind_a_pickup_grace() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Reaver);
        if let Some(player) = state.players.get_mut("p1") {
            player.credits = 250;
            player.inventory[0] = Some(module_item(2));
            player.equipment.weapon = Some(weapon_item(1, WeaponKind::Emitter, "Pulse Emitter"));
        }
        let source = DamageSource { player_id: None, name: "Drifter".to_string() };
        kill_player(&mut state, "p1", &source);

        let (bag_id, item_count, credits, delay) = state
            .entities
            .iter()
            .find_map(|entity| match &entity.kind {
                EntityKind::LootBag { items, credits, pickup_delay } => {
                    Some((entity.id, items.len(), *credits, *pickup_delay))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(credits, 200);
        assert_eq!(item_count, 2);
        assert_eq!(delay, LOOT_BAG_PICKUP_DELAY);

        // inside the grace window nothing can be taken
        add_player(&mut state, "p2", PlayerClass::Reaver);
        pickup_loot(&mut state, "p2", bag_id, None);
        assert_eq!(state.players["p2"].credits, 0);

        update_entities(&mut state, LOOT_BAG_PICKUP_DELAY + 0.5);
        pickup_loot(&mut state, "p2", bag_id, None);
        assert_eq!(state.players["p2"].credits, 200);
    }

    #[test]
    fn respawn_wipes_back_to_level_one() {
        let mut state = test_state();
        add_player(&mut state, "p1", PlayerClass::Bulwark);
        if let Some(player) = state.players.get_mut("p1") {
            player.level = 5;
            player.credits = 400;
            player.inventory[2] = Some(module_item(3));
            player.is_dead = true;
        }
        if let Some(player) = state.players.get_mut("p1") {
            player.respawn();
        }
        let player = &state.players["p1"];
        assert_eq!(player.level, 1);
        assert_eq!(player.credits, 0);
        assert!(player.inventory.iter().all(|slot| slot.is_none()));
        assert!(!player.is_dead);
        assert_eq!((player.x, player.y), CITY_SPAWN);
    }
}
