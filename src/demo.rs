//! Demo `/user` namespace served by `socket-call serve`.
//!
//! - `login(username)` remembers the user on the connection and greets them.
//! - `sendReminderIn5Seconds()` pushes `showReminder` after a delay.
//! - `runProcess()` pushes `showProgress(id)` now and `showProgressEnd(id)`
//!   when the simulated process finishes.

use std::time::Duration;

use serde_json::{json, Value};

use crate::server::{Handlers, NamespaceServer, Server, Services};

/// Path of the demo namespace.
pub const USER_NAMESPACE: &str = "/user";

/// Events the demo namespace answers.
pub const USER_EMIT_EVENTS: [&str; 3] = ["login", "sendReminderIn5Seconds", "runProcess"];

/// Events the demo namespace pushes.
pub const USER_LISTEN_EVENTS: [&str; 3] = ["showReminder", "showProgress", "showProgressEnd"];

/// Timing of the demo's delayed pushes.
#[derive(Debug, Clone, Copy)]
pub struct UserDemoTiming {
    /// Delay before `showReminder`.
    pub reminder_delay: Duration,
    /// Time between `showProgress` and `showProgressEnd`.
    pub process_duration: Duration,
}

impl Default for UserDemoTiming {
    fn default() -> Self {
        Self {
            reminder_delay: Duration::from_secs(5),
            process_duration: Duration::from_secs(2),
        }
    }
}

/// Server hosting only the demo namespace.
pub fn server(timing: UserDemoTiming) -> Server {
    Server::new().with_namespace(user_namespace(timing))
}

/// The demo `/user` namespace.
pub fn user_namespace(timing: UserDemoTiming) -> NamespaceServer {
    NamespaceServer::new(USER_NAMESPACE, move |services| {
        let login = services.clone();
        let reminder = services.clone();
        let process = services;
        Handlers::new()
            .on("login", move |args| {
                let services = login.clone();
                async move {
                    let username = args
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    services.set_data("user", json!({ "username": username }));
                    log::info!("[Server] User {} logged in", username);
                    json!(format!("You are now logged in {username}!"))
                }
            })
            .on("sendReminderIn5Seconds", move |_| {
                let services = reminder.clone();
                async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(timing.reminder_delay).await;
                        let message =
                            format!("Hey {}, you asked me to remind you!", username(&services));
                        push(&services, "showReminder", vec![json!(message)]);
                    });
                    Value::Null
                }
            })
            .on("runProcess", move |_| {
                let services = process.clone();
                async move {
                    let process_id = uuid::Uuid::new_v4().as_u64_pair().0 % 1000;
                    push(&services, "showProgress", vec![json!(process_id)]);
                    tokio::spawn(async move {
                        tokio::time::sleep(timing.process_duration).await;
                        if let Err(e) = services.emit_end("showProgress", vec![json!(process_id)]) {
                            log::warn!("[Server] Failed to end process {}: {}", process_id, e);
                        }
                    });
                    Value::Null
                }
            })
    })
}

fn username(services: &Services) -> String {
    services
        .data("user")
        .and_then(|user| user.get("username").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| "there".to_string())
}

fn push(services: &Services, event: &str, args: Vec<Value>) {
    if let Err(e) = services.emit(event, args) {
        log::warn!("[Server] Failed to push {}: {}", event, e);
    }
}
