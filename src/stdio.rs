//! Line-oriented local binding: one JSON request per stdin line, one JSON
//! response per stdout line. Meant for embedding the broker as a
//! subordinate tool provider under another process.

use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use toolgate_broker::{error_body, Broker};

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(default)]
    id: Value,
    op: String,
    #[serde(default)]
    params: Value,
}

pub async fn serve(broker: Arc<Broker>) -> anyhow::Result<()> {
    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&broker, &line).await;
        let mut bytes = serde_json::to_vec(&reply)?;
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_line(broker: &Broker, line: &str) -> Value {
    match serde_json::from_str::<WireRequest>(line) {
        Ok(request) => match broker.dispatch(&request.op, request.params).await {
            Ok(result) => json!({"id": request.id, "result": result}),
            Err(e) => json!({"id": request.id, "error": error_body(&e)}),
        },
        Err(e) => json!({
            "id": Value::Null,
            "error": {"kind": "invalid_arguments", "message": format!("malformed request: {e}")},
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgate_broker::{
        BrokerConfig, CatalogSearch, CatalogStore, ChildProcessLauncher, LifecycleManager,
        ServerRegistry,
    };

    async fn empty_broker() -> (Broker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::from_config(BrokerConfig::default()));
        let store = Arc::new(CatalogStore::open(dir.path()).await.unwrap());
        let search = Arc::new(CatalogSearch::new(Arc::clone(&store)));
        let manager = LifecycleManager::new(
            Arc::clone(&registry),
            Arc::new(ChildProcessLauncher),
            Arc::clone(&store),
            Arc::clone(&search),
        );
        (Broker::new(manager, registry, store, search), dir)
    }

    #[tokio::test]
    async fn test_request_and_error_framing() {
        let (broker, _dir) = empty_broker().await;

        let reply = handle_line(&broker, r#"{"id": 7, "op": "list_servers"}"#).await;
        assert_eq!(reply["id"], 7);
        assert!(reply["result"]["servers"].as_array().unwrap().is_empty());

        let reply = handle_line(&broker, r#"{"id": 8, "op": "connect", "params": {"server": "ghost"}}"#).await;
        assert_eq!(reply["id"], 8);
        assert_eq!(reply["error"]["kind"], "config_not_found");

        let reply = handle_line(&broker, "not json").await;
        assert_eq!(reply["error"]["kind"], "invalid_arguments");
    }
}
