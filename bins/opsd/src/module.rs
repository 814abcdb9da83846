use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handed to every module at spawn time.
#[derive(Clone)]
pub struct ModuleCtx {
    pub shutdown: watch::Receiver<bool>,
}

/// A long-running component owned by the daemon. `spawn` starts it and
/// returns a handle that resolves once it has fully stopped after
/// `shutdown` flips to `true`.
pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}

/// Resolves once `rx` reads `true` or its sender is gone. Safe to use in a
/// `select!` arm at every suspension point.
pub async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
