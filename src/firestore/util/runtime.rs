use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("firestore-background")
        .enable_all()
        .build()
        .expect("failed to build background tokio runtime")
});

/// Spawns `future` on the ambient tokio runtime, or on a private background
/// runtime when called outside of one.
pub fn spawn<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => handle.spawn(future),
        Err(_) => BACKGROUND_RUNTIME.spawn(future),
    }
}

pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn spawn_outside_runtime_runs_task() {
        let (sender, receiver) = mpsc::channel();
        spawn(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send(7);
        });
        let value = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("background task ran");
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn spawn_inside_runtime_uses_ambient_handle() {
        let handle = spawn(async {});
        handle.await.unwrap();
    }
}
