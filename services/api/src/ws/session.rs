//! Manages one progress subscription over a WebSocket.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{handlers::ApiError, models::CourseResponse, state::AppState};
use anyhow::Result;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use coursegen_core::{Course, CourseId, ProgressEvent, ProgressStream};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Upgrades to a WebSocket that pushes the course's progress events.
///
/// The subscription is taken before the upgrade, so an unknown course is a
/// plain 404 and no event between the snapshot and the first push is lost.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(course_id): Path<CourseId>,
) -> Result<Response, ApiError> {
    let events = state.orchestrator.subscribe(course_id).await?;
    let course = state.orchestrator.get_course(course_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, course, events)))
}

#[instrument(name = "ws_session", skip_all, fields(course_id = %course.id, connection))]
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    course: Course,
    events: ProgressStream,
) {
    let connection: u32 = rand::random();
    tracing::Span::current().record("connection", connection);
    info!("Progress subscriber connected");

    if let Err(e) = run_session(socket, &state, course, events).await {
        error!(error = ?e, "Progress session terminated with error.");
    }
    info!("Progress subscriber disconnected");
}

/// Forwards events until the client closes, the socket fails, or the
/// course's channel is closed by deletion.
async fn run_session(
    socket: WebSocket,
    state: &AppState,
    course: Course,
    mut events: ProgressStream,
) -> Result<()> {
    let course_id = course.id;
    let (mut socket_tx, mut socket_rx) = socket.split();
    send_msg(
        &mut socket_tx,
        ServerMessage::Subscribed {
            course: CourseResponse::from(&course),
        },
    )
    .await?;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    info!("Course channel closed.");
                    break;
                };
                if let ProgressEvent::CourseComplete { ready, failed } = &event {
                    debug!(ready, failed, "Forwarding course completion");
                }
                send_msg(&mut socket_tx, ServerMessage::Progress { event }).await?;
            },
            msg = socket_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Snapshot) => {
                            let reply = match state.orchestrator.get_course(course_id).await {
                                Ok(course) => ServerMessage::Snapshot { course: CourseResponse::from(&course) },
                                Err(e) => ServerMessage::Error { message: e.to_string() },
                            };
                            send_msg(&mut socket_tx, reply).await?;
                        }
                        Ok(ClientMessage::Ping) => send_msg(&mut socket_tx, ServerMessage::Pong).await?,
                        Err(e) => warn!(error = %e, "Ignoring unrecognized client message."),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed the connection.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            },
        }
    }
    let _ = socket_tx.close().await;
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
