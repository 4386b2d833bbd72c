//! In-memory tabletop used by the bundled channel clients.
//!
//! Mirrors the shape of the browser SDK calls a real tab would make (scene
//! items, room metadata, party) so the relay can be exercised end to end
//! without a browser.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::executor::{ActionExecutor, ActionSet};
use crate::protocol::{Metadata, merge_metadata};

/// Actions the in-memory tabletop understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletopAction {
    Echo,
    GetGameState,
    GetItems,
    CreateShape,
    DeleteItem,
    GetRoomMetadata,
    SetRoomMetadata,
    GetPlayers,
    Notify,
}

impl ActionSet for TabletopAction {
    const ALL: &'static [Self] = &[
        Self::Echo,
        Self::GetGameState,
        Self::GetItems,
        Self::CreateShape,
        Self::DeleteItem,
        Self::GetRoomMetadata,
        Self::SetRoomMetadata,
        Self::GetPlayers,
        Self::Notify,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::GetGameState => "getGameState",
            Self::GetItems => "getItems",
            Self::CreateShape => "createShape",
            Self::DeleteItem => "deleteItem",
            Self::GetRoomMetadata => "getRoomMetadata",
            Self::SetRoomMetadata => "setRoomMetadata",
            Self::GetPlayers => "getPlayers",
            Self::Notify => "notify",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A scene item. Only shapes are modelled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub layer: String,
    pub shape_type: String,
    pub position: Position,
    pub width: f64,
    pub height: f64,
    pub fill_color: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShapeRequest {
    #[serde(default = "default_shape_type")]
    shape_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_layer")]
    layer: String,
    #[serde(default)]
    position: Option<Position>,
    #[serde(default = "default_size")]
    width: f64,
    #[serde(default = "default_size")]
    height: f64,
    #[serde(default = "default_fill")]
    fill_color: String,
}

fn default_shape_type() -> String {
    "RECTANGLE".to_string()
}

fn default_layer() -> String {
    "DRAWING".to_string()
}

fn default_size() -> f64 {
    100.0
}

fn default_fill() -> String {
    "#000000".to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    pub role: String,
}

struct TabletopState {
    items: Vec<SceneItem>,
    room_metadata: Metadata,
    players: Vec<Player>,
    notifications: Vec<String>,
    next_item: u64,
}

/// Scene, room and party state for one simulated tab.
pub struct TabletopExecutor {
    player: Player,
    state: Mutex<TabletopState>,
}

impl TabletopExecutor {
    pub fn new(player_name: impl Into<String>) -> Self {
        let player = Player {
            id: format!("player_{}", Utc::now().timestamp_millis()),
            name: player_name.into(),
            role: "GM".to_string(),
        };
        Self {
            state: Mutex::new(TabletopState {
                items: Vec::new(),
                room_metadata: Metadata::new(),
                players: vec![player.clone()],
                notifications: Vec::new(),
                next_item: 1,
            }),
            player,
        }
    }

    /// Notifications shown so far, oldest first.
    pub fn notifications(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.notifications.clone())
            .unwrap_or_default()
    }

    fn run(&self, action: TabletopAction, args: Vec<Value>) -> Result<Value, String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| "tabletop state is unavailable".to_string())?;

        match action {
            TabletopAction::Echo => Ok(match args.len() {
                0 => Value::Null,
                1 => args.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(args),
            }),
            TabletopAction::GetGameState => Ok(json!({
                "items": state.items,
                "players": state.players,
                "room": state.room_metadata,
                "metadata": {
                    "sceneReady": true,
                    "playerRole": self.player.role,
                    "playerId": self.player.id,
                    "playerName": self.player.name,
                },
                "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            })),
            TabletopAction::GetItems => {
                let layer = args.first().and_then(Value::as_str);
                let items: Vec<&SceneItem> = state
                    .items
                    .iter()
                    .filter(|item| layer.is_none_or(|l| item.layer == l))
                    .collect();
                serde_json::to_value(items).map_err(|e| e.to_string())
            }
            TabletopAction::CreateShape => {
                let request: ShapeRequest = serde_json::from_value(
                    args.into_iter().next().unwrap_or_else(|| json!({})),
                )
                .map_err(|e| format!("Invalid shape: {e}"))?;
                let id = format!("item_{}", state.next_item);
                state.next_item += 1;
                let item = SceneItem {
                    name: request.name.unwrap_or_else(|| format!("Shape {id}")),
                    id,
                    kind: "SHAPE",
                    layer: request.layer,
                    shape_type: request.shape_type,
                    position: request.position.unwrap_or(Position { x: 0.0, y: 0.0 }),
                    width: request.width,
                    height: request.height,
                    fill_color: request.fill_color,
                };
                let value = serde_json::to_value(&item).map_err(|e| e.to_string())?;
                state.items.push(item);
                Ok(value)
            }
            TabletopAction::DeleteItem => {
                let id = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| "deleteItem expects an item id".to_string())?;
                let before = state.items.len();
                state.items.retain(|item| item.id != id);
                if state.items.len() == before {
                    return Err(format!("Item {id} not found"));
                }
                Ok(json!({ "deleted": id }))
            }
            TabletopAction::GetRoomMetadata => Ok(Value::Object(state.room_metadata.clone())),
            TabletopAction::SetRoomMetadata => {
                let Some(Value::Object(partial)) = args.into_iter().next() else {
                    return Err("setRoomMetadata expects an object".to_string());
                };
                merge_metadata(&mut state.room_metadata, partial);
                Ok(Value::Object(state.room_metadata.clone()))
            }
            TabletopAction::GetPlayers => {
                serde_json::to_value(&state.players).map_err(|e| e.to_string())
            }
            TabletopAction::Notify => {
                let message = match args.first() {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err("notify expects a message".to_string()),
                };
                tracing::info!(message = %message, "Tabletop notification");
                state.notifications.push(message);
                Ok(json!({ "notified": true }))
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for TabletopExecutor {
    type Action = TabletopAction;

    async fn execute(&self, action: TabletopAction, args: Vec<Value>) -> Result<Value, String> {
        self.run(action, args)
    }
}
