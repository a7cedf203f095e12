#![allow(dead_code)]

use std::collections::HashMap;

use hubbub::{config::Config, server::Server};

pub async fn spawn_server() -> String {
    spawn_server_with(&[]).await
}

/// Spawn a hub on an ephemeral port with `overrides` applied to the default configuration.
pub async fn spawn_server_with(overrides: &[(&str, &str)]) -> String {
    let config = {
        let vars: HashMap<String, String> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::load_with_sources(Some(vars)).unwrap();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    };

    let server = Server::new(&config).await.unwrap();

    let port = server.port();
    tokio::spawn(server.run());

    format!("http://{}:{}", config.server.host, port)
}

/// Callback that confirms every verification by echoing `hub.challenge`.
pub struct EchoChallenge;

impl wiremock::Respond for EchoChallenge {
    fn respond(&self, request: &wiremock::Request) -> wiremock::ResponseTemplate {
        let challenge = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "hub.challenge")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        wiremock::ResponseTemplate::new(200).set_body_string(challenge)
    }
}

/// Poll `server` until it has seen `count` POSTs, or give up after a few seconds.
pub async fn wait_for_posts(server: &wiremock::MockServer, count: usize) -> Vec<wiremock::Request> {
    for _ in 0..100 {
        let posts: Vec<_> = server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "POST")
            .collect();
        if posts.len() >= count {
            return posts;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("expected {count} deliveries");
}
