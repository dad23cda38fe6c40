//! Threads an accumulator through an ordered sequence of items.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::errors::{ConduitError, ConduitResult};

pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SequenceConfig {
    /// Keep `initial` and every post-step accumulator
    pub expose_intermediate: bool,
    /// Called with `(completed, total)` after each item
    pub progress: Option<ProgressFn>,
}

impl SequenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expose_intermediate(mut self, expose: bool) -> Self {
        self.expose_intermediate = expose;
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl fmt::Debug for SequenceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceConfig")
            .field("expose_intermediate", &self.expose_intermediate)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutput<A> {
    pub final_state: A,
    /// `initial` followed by the accumulator after each item, when requested
    pub intermediate: Option<Vec<A>>,
}

/// Run `step` over `items` in order, feeding each result into the next call.
///
/// Cancellation is checked before every item. A failing step stops the run
/// and its error is returned wrapped with the zero-based item index.
pub async fn process_sequentially<'a, I, A, F, Fut>(
    cancel: &CancellationToken,
    items: &'a [I],
    initial: A,
    config: &SequenceConfig,
    mut step: F,
) -> ConduitResult<SequenceOutput<A>>
where
    A: Clone,
    F: FnMut(CancellationToken, &'a I, A) -> Fut,
    Fut: Future<Output = ConduitResult<A>>,
{
    if items.is_empty() {
        return Ok(SequenceOutput {
            final_state: initial,
            intermediate: None,
        });
    }

    let total = items.len();
    let mut intermediate = config.expose_intermediate.then(|| {
        let mut states = Vec::with_capacity(total + 1);
        states.push(initial.clone());
        states
    });
    let mut state = initial;

    for (index, item) in items.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ConduitError::Cancelled);
        }

        state = step(cancel.clone(), item, state)
            .await
            .map_err(|source| ConduitError::Step {
                index,
                source: Box::new(source),
            })?;
        tracing::debug!(index, total, "processed item");

        if let Some(states) = intermediate.as_mut() {
            states.push(state.clone());
        }
        if let Some(progress) = &config.progress {
            progress(index + 1, total);
        }
    }

    Ok(SequenceOutput {
        final_state: state,
        intermediate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_empty_sequence_returns_initial() -> anyhow::Result<()> {
        let calls = AtomicUsize::new(0);
        let items: Vec<u32> = Vec::new();
        let output = process_sequentially(
            &CancellationToken::new(),
            &items,
            7u32,
            &SequenceConfig::new().expose_intermediate(true),
            |_, _, acc| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(acc) }
            },
        )
        .await?;

        assert_eq!(output.final_state, 7);
        assert_eq!(output.intermediate, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_intermediate_has_initial_plus_every_step() -> anyhow::Result<()> {
        let items = vec![1u32, 2, 3];
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress_seen = seen.clone();
        let config = SequenceConfig::new()
            .expose_intermediate(true)
            .with_progress(move |done, total| {
                if let Ok(mut seen) = progress_seen.lock() {
                    seen.push((done, total));
                }
            });

        let output = process_sequentially(
            &CancellationToken::new(),
            &items,
            0u32,
            &config,
            |_, item, acc| async move { Ok(acc + item) },
        )
        .await?;

        assert_eq!(output.final_state, 6);
        assert_eq!(output.intermediate, Some(vec![0, 1, 3, 6]));
        assert_eq!(
            *seen.lock().map_err(|e| anyhow::anyhow!(e.to_string()))?,
            vec![(1, 3), (2, 3), (3, 3)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_step_failure_reports_index_and_stops() {
        let items = vec!["a", "b", "c", "d", "e"];
        let visited = Mutex::new(Vec::new());

        let error = process_sequentially(
            &CancellationToken::new(),
            &items,
            String::new(),
            &SequenceConfig::new().expose_intermediate(true),
            |_, item, acc| {
                if let Ok(mut visited) = visited.lock() {
                    visited.push(*item);
                }
                async move {
                    if *item == "c" {
                        Err(ConduitError::DecodeFailed("unreadable page".into()))
                    } else {
                        Ok(acc + *item)
                    }
                }
            },
        )
        .await
        .unwrap_err();

        match error {
            ConduitError::Step { index, source } => {
                assert_eq!(index, 2);
                assert!(matches!(*source, ConduitError::DecodeFailed(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*visited.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_item() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);

        let error = process_sequentially(
            &cancel,
            &[1, 2, 3],
            0,
            &SequenceConfig::new(),
            |_, _, acc| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(acc) }
            },
        )
        .await
        .unwrap_err();

        assert!(error.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_between_items() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let error = process_sequentially(
            &cancel,
            &[1, 2, 3],
            0,
            &SequenceConfig::new(),
            |_, item, acc| {
                if *item == 1 {
                    trigger.cancel();
                }
                async move { Ok(acc + item) }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(error, ConduitError::Cancelled));
    }
}
