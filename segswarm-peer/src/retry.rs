use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Retry(pub Arc<Mutex<dyn Backoff + Send + Sync>>);

impl Retry {
    /// Exponential backoff that gives up once `max_elapsed` has passed.
    pub fn with_max_elapsed(max_elapsed: Duration) -> Retry {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(max_elapsed),
            ..ExponentialBackoff::default()
        };
        Self(Arc::new(Mutex::new(backoff)))
    }
}

impl Default for Retry {
    fn default() -> Retry {
        Self(Arc::new(Mutex::new(ExponentialBackoff::default())))
    }
}

#[macro_export]
macro_rules! backoff_retry {
    ($cancel:expr, $retry:expr, $attempt:block, $exhausted:block) => {
        {
            let mut _final_result = Ok(());
            let mut _attempt = 0u32;
            loop {
                let _result = async {
                    $attempt
                    Ok::<(), backoff::Error<$crate::Error>>(())
                }.await;
                match _result {
                    Ok(()) => {
                        if _attempt > 0 {
                            tracing::info!(attempt = _attempt, "retry successful");
                        }
                        $retry.0.lock().await.reset();
                        _final_result = Ok(());
                        break;
                    }
                    Err(backoff::Error::Permanent(err)) => {
                        _final_result = Err(err);
                        break;
                    }
                    Err(backoff::Error::Transient { err, retry_after }) => {
                        let mut _retry = $retry.0.lock().await;
                        match retry_after.or(_retry.next_backoff()) {
                            Some(delay) => {
                                _attempt += 1;
                                tracing::warn!(?delay, attempt = _attempt, err = %err, "retrying");
                                tokio::select! {
                                    _ = $cancel.cancelled() => {
                                        _final_result = Err($crate::CancelError.into());
                                        break;
                                    }
                                    _ = tokio::time::sleep(delay) => {}
                                };
                            }
                            None => {
                                $exhausted
                                _final_result = Err(err);
                                _retry.reset();
                                break;
                            }
                        }
                    }
                }
            }
            _final_result
        }
    };
    ($cancel:expr, $retry:expr, $attempt:block) => {
        $crate::backoff_retry!($cancel, $retry, $attempt, {})
    }
}
