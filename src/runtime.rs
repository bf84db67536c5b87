#[cfg(feature = "rt-tokio")]
use crate::Error;
use crate::Result;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[cfg(feature = "rt-async-io")]
pub(crate) fn sleep(duration: Duration) -> BoxFuture<()> {
    Box::pin(async move {
        let _ = async_io::Timer::after(duration).await;
    })
}

#[cfg(feature = "rt-tokio")]
pub(crate) fn sleep(duration: Duration) -> BoxFuture<()> {
    Box::pin(tokio::time::sleep(duration))
}

/// Executor for the engine thread.
///
/// Subprocess I/O goes through `async-process` under both runtimes; the runtime only has to drive
/// the futures and provide the deadline timer.
#[derive(Debug)]
pub(crate) struct Runtime {
    #[cfg(feature = "rt-tokio")]
    rt: tokio::runtime::Runtime,
}

impl Runtime {
    #[cfg(feature = "rt-async-io")]
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(feature = "rt-tokio")]
    pub(crate) fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::IoError {
                context: format!("init tokio runtime: {e}"),
            })?;
        Ok(Self { rt })
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        #[cfg(feature = "rt-async-io")]
        {
            async_io::block_on(future)
        }

        #[cfg(feature = "rt-tokio")]
        {
            self.rt.block_on(future)
        }
    }
}
