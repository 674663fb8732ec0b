use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::{info, warn};

use common::{CanonicalMarket, MarketKind};
use notify::{bot_topic, price_topic};

use crate::AppState;

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
    user: Option<String>,
}

/// Inbound subscription protocol frames.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    action: String,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    items: Option<Vec<PriceSubscription>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceSubscription {
    exchange_id: String,
    market_type: String,
    symbol: String,
}

/// Per-user WebSocket endpoint. Auth via query params (browsers can't set
/// custom WS headers): `?token=<DASHBOARD_TOKEN>&user=<userId>`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
) -> Response {
    let authed = q
        .token
        .as_deref()
        .map(|t| t == state.dashboard_token)
        .unwrap_or(false);
    let Some(user_id) = q.user.filter(|_| authed) else {
        return axum::response::IntoResponse::into_response((
            axum::http::StatusCode::UNAUTHORIZED,
            "unauthorized",
        ));
    };

    ws.on_upgrade(move |socket| handle_ws(socket, state, user_id))
}

async fn handle_ws(socket: WebSocket, state: AppState, user_id: String) {
    let mut handle = state.bus.connect(&user_id).await;
    let conn_id = handle.id;
    let (mut sink, mut inbound) = futures_util::StreamExt::split(socket);

    // Bus → socket.
    let writer = tokio::spawn(async move {
        use futures_util::SinkExt;
        while let Some(message) = handle.rx.recv().await {
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
    });

    // Socket → subscription bookkeeping.
    while let Some(frame) = futures_util::StreamExt::next(&mut inbound).await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
            warn!(user = %user_id, "Unparseable WS frame");
            continue;
        };

        match message.action.as_str() {
            "SUBSCRIBE_BOT" => {
                if let Some(bot_id) = &message.bot_id {
                    state.bus.subscribe_topic(conn_id, &bot_topic(bot_id)).await;
                }
            }
            "UNSUBSCRIBE_BOT" => {
                if let Some(bot_id) = &message.bot_id {
                    state
                        .bus
                        .unsubscribe_topic(conn_id, &bot_topic(bot_id))
                        .await;
                }
            }
            "PRICES_SUBSCRIBE" => {
                for item in message.items.unwrap_or_default() {
                    let kind = MarketKind::parse(&item.market_type);
                    let topic = price_topic(
                        &item.exchange_id.to_lowercase(),
                        CanonicalMarket::from_label(&item.market_type),
                        &item.symbol,
                    );
                    state.bus.subscribe_topic(conn_id, &topic).await;
                    // Make sure a live ticker task backs the topic.
                    state
                        .streams
                        .subscribe_ticker(&item.exchange_id, kind, &item.symbol)
                        .await;
                }
            }
            "PING" => {
                state
                    .bus
                    .send_to_connection(conn_id, r#"{"type":"PONG"}"#.to_string())
                    .await;
            }
            other => warn!(user = %user_id, action = other, "Unknown WS action"),
        }
    }

    info!(user = %user_id, conn = conn_id, "WebSocket client disconnected");
    state.bus.disconnect(conn_id).await;
    writer.abort();
}
