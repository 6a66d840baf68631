//! HTTP side channels: health, the command catalog, and static assets.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub uptime: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
        uptime: state.started_at.elapsed().as_secs(),
    })
}

/// One canned invocation of the target binary the frontend can offer as a
/// one-click flow.
#[derive(Debug, Clone, Serialize)]
pub struct CommandPreset {
    pub id: &'static str,
    pub name: &'static str,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandCatalog {
    pub commands: Vec<CommandPreset>,
}

pub async fn commands(State(state): State<AppState>) -> Json<CommandCatalog> {
    Json(CommandCatalog {
        commands: presets(&state.config.command),
    })
}

fn presets(command: &str) -> Vec<CommandPreset> {
    let preset = |id, name, args: &[&str]| CommandPreset {
        id,
        name,
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
    };
    vec![
        preset("onboard", "Full Onboarding", &["onboard"]),
        preset("configure", "Configure", &["configure"]),
        preset("doctor", "Health Check", &["doctor"]),
        preset("channels", "Add Channels", &["channels", "login"]),
        preset("status", "Status", &["status"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_the_setup_flows() {
        let presets = presets("hubctl");
        let ids: Vec<&str> = presets.iter().map(|p| p.id).collect();
        assert_eq!(
            ids,
            vec!["onboard", "configure", "doctor", "channels", "status"]
        );
        assert!(presets.iter().all(|p| p.command == "hubctl"));
    }

    #[test]
    fn channels_preset_carries_the_subcommand() {
        let presets = presets("hubctl");
        let channels = presets.iter().find(|p| p.id == "channels").unwrap();
        assert_eq!(channels.args, vec!["channels", "login"]);
    }
}
