use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::watch;

/// MirrorRouter: IPC 传输层 (system bus / stdio) 所依赖的接口
#[async_trait]
pub trait MirrorRouter: Sync + Send {
    /// 返回与 `original` 等价、但由最快可用镜像提供的 URL
    /// 永远不会失败: 降级时直接返回 `original`
    async fn query(&self, original: &str, official: &str, mirror_hint: &str) -> String;

    /// 修改并持久化 Enable 开关
    async fn set_enable(&self, enable: bool) -> Result<()>;

    /// Current value of the `Enable` property.
    fn enable(&self) -> bool;

    /// Receives every change of the `Enable` property.
    fn subscribe_enable(&self) -> watch::Receiver<bool>;

    /// Whether the process may exit now without losing probe outcomes.
    fn can_quit(&self) -> bool;
}
