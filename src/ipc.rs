//! JSON-lines transport over stdin/stdout.
//!
//! Requests: `{"id": 1, "method": "Query", "params": [original, official, hint]}`,
//! `{"method": "SetEnable", "params": [false]}`, `{"method": "GetEnable"}`.
//! Every request gets one response line (`result` or `error`, plus the `id`
//! when given). Changes of `Enable` are pushed as `PropertiesChanged` lines.

use crate::error::{MirrorError, Result};
use crate::traits::MirrorRouter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// Handle one request line and build its response.
pub async fn handle_line<R: MirrorRouter + ?Sized>(router: &R, line: &str) -> Value {
    let req: RawRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return malformed(e),
    };

    let mut resp = match dispatch(router, &req.method, &req.params).await {
        Ok(v) => json!({ "result": v }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    if let Some(id) = req.id {
        resp["id"] = id;
    }
    resp
}

async fn dispatch<R: MirrorRouter + ?Sized>(router: &R, method: &str, params: &[Value]) -> Result<Value> {
    match method {
        "Query" => {
            let arg = |i: usize| params.get(i).and_then(Value::as_str).unwrap_or("");
            Ok(Value::String(router.query(arg(0), arg(1), arg(2)).await))
        }
        "SetEnable" => {
            let enable = params
                .first()
                .and_then(Value::as_bool)
                .ok_or_else(|| MirrorError::Custom("SetEnable expects one bool".to_string()))?;
            router.set_enable(enable).await?;
            Ok(Value::Null)
        }
        "GetEnable" => Ok(Value::Bool(router.enable())),
        other => Err(MirrorError::Custom(format!("Unknown method: {}", other))),
    }
}

fn malformed(reason: impl std::fmt::Display) -> Value {
    json!({ "error": format!("malformed request: {}", reason) })
}

fn enable_changed(enable: bool) -> Value {
    json!({ "signal": "PropertiesChanged", "property": "Enable", "value": enable })
}

/// 处理请求直到输入结束或 `shutdown` 完成
///
/// 每个请求在独立任务中处理; 返回前会等待所有进行中的请求写出响应
pub async fn serve<R, I, O, S>(router: Arc<R>, input: I, output: O, shutdown: S) -> Result<()>
where
    R: MirrorRouter + ?Sized + 'static,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = out_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let signals = {
        let mut enable_rx = router.subscribe_enable();
        let tx = out_tx.clone();
        tokio::spawn(async move {
            while enable_rx.changed().await.is_ok() {
                let value = *enable_rx.borrow_and_update();
                if tx.send(enable_changed(value).to_string()).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    tokio::pin!(shutdown);

    loop {
        buf.clear();
        tokio::select! {
            read = reader.read_until(b'\n', &mut buf) => {
                if read? == 0 {
                    debug!("Input closed");
                    break;
                }
                // 非 UTF-8 的行只回一个错误, 不结束服务
                let line = match String::from_utf8(std::mem::take(&mut buf)) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping malformed request line: {}", e);
                        let _ = out_tx.send(malformed(e).to_string()).await;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let router = router.clone();
                let tx = out_tx.clone();
                tokio::spawn(async move {
                    let resp = handle_line(&*router, line.trim_end()).await;
                    let _ = tx.send(resp.to_string()).await;
                });
            }
            _ = &mut shutdown => {
                info!("Idle, shutting down");
                break;
            }
        }
    }

    signals.abort();
    let _ = signals.await;
    drop(out_tx);
    match writer.await {
        Ok(res) => res?,
        Err(e) => warn!("Output writer failed: {}", e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::sync::watch;

    /// 不做网络请求的路由, 只回显参数
    struct EchoRouter {
        enable: AtomicBool,
        tx: watch::Sender<bool>,
    }

    impl EchoRouter {
        fn new() -> Self {
            Self {
                enable: AtomicBool::new(true),
                tx: watch::channel(true).0,
            }
        }
    }

    #[async_trait]
    impl MirrorRouter for EchoRouter {
        async fn query(&self, original: &str, official: &str, mirror_hint: &str) -> String {
            format!("{}|{}|{}", original, official, mirror_hint)
        }

        async fn set_enable(&self, enable: bool) -> Result<()> {
            self.enable.store(enable, Ordering::SeqCst);
            self.tx.send_replace(enable);
            Ok(())
        }

        fn enable(&self) -> bool {
            self.enable.load(Ordering::SeqCst)
        }

        fn subscribe_enable(&self) -> watch::Receiver<bool> {
            self.tx.subscribe()
        }

        fn can_quit(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_handle_line() {
        let router = EchoRouter::new();

        let resp = handle_line(&router, r#"{"id": 7, "method": "Query", "params": ["a", "b"]}"#).await;
        assert_eq!(resp, json!({ "id": 7, "result": "a|b|" }));

        let resp = handle_line(&router, r#"{"method": "SetEnable", "params": [false]}"#).await;
        assert_eq!(resp, json!({ "result": null }));
        assert!(!router.enable());

        let resp = handle_line(&router, r#"{"method": "GetEnable"}"#).await;
        assert_eq!(resp, json!({ "result": false }));

        let resp = handle_line(&router, r#"{"method": "SetEnable", "params": ["yes"]}"#).await;
        assert!(resp.get("error").is_some());

        let resp = handle_line(&router, r#"{"method": "Remove"}"#).await;
        assert!(resp["error"].as_str().unwrap().contains("Unknown method"));

        let resp = handle_line(&router, "not json").await;
        assert!(resp["error"].as_str().unwrap().starts_with("malformed request"));
    }

    #[tokio::test]
    async fn test_serve_until_eof() -> Result<()> {
        let router = Arc::new(EchoRouter::new());
        let input = concat!(
            r#"{"id": 1, "method": "Query", "params": ["u", "o", "h"]}"#,
            "\n\n",
            r#"{"id": 2, "method": "SetEnable", "params": [false]}"#,
            "\n"
        );
        let (out_w, mut out_r) = tokio::io::duplex(4096);

        serve(router, input.as_bytes(), out_w, std::future::pending()).await?;

        let mut output = String::new();
        out_r.read_to_string(&mut output).await?;
        let lines: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert!(lines.contains(&json!({ "id": 1, "result": "u|o|h" })));
        assert!(lines.contains(&json!({ "id": 2, "result": null })));
        Ok(())
    }

    #[tokio::test]
    async fn test_serve_survives_invalid_utf8() -> Result<()> {
        let router = Arc::new(EchoRouter::new());
        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(br#"{"id": 2, "method": "GetEnable"}"#);
        input.push(b'\n');
        let (out_w, mut out_r) = tokio::io::duplex(4096);

        serve(router, input.as_slice(), out_w, std::future::pending()).await?;

        let mut output = String::new();
        out_r.read_to_string(&mut output).await?;
        let lines: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0]["error"].as_str().unwrap().starts_with("malformed request"));
        assert!(lines.contains(&json!({ "id": 2, "result": true })));
        Ok(())
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() -> Result<()> {
        let router = Arc::new(EchoRouter::new());
        // 输入端保持打开, 只有 shutdown 能结束循环
        let (_in_w, in_r) = tokio::io::duplex(64);
        let (out_w, _out_r) = tokio::io::duplex(64);

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            serve(router, in_r, out_w, async {}),
        )
        .await
        .expect("serve should return on shutdown")?;
        Ok(())
    }
}
