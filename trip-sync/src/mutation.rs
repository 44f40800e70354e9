use crate::SyncError;

/// Optimistic update, remote call, then reconcile or roll back.
///
/// `apply` runs first and returns whatever `rollback` needs to undo it. The remote call is built
/// from that value. On success `reconcile` sees the result; on failure `rollback` runs before the
/// error is returned, so no optimistic state outlives a failed call.
pub(crate) async fn run_optimistic<S, T, Call, Undo>(
    apply: impl FnOnce() -> S,
    remote: impl FnOnce(&S) -> Call,
    rollback: impl FnOnce(S) -> Undo,
    reconcile: impl FnOnce(&T),
) -> Result<T, SyncError>
where
    Call: Future<Output = Result<T, SyncError>>,
    Undo: Future<Output = ()>,
{
    let undo = apply();
    match remote(&undo).await {
        Ok(value) => {
            reconcile(&value);
            Ok(value)
        }
        Err(e) => {
            log::warn!("Rolling back optimistic update: {e}");
            rollback(undo).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::cell::RefCell;

    #[test]
    fn test_rollback_restores_snapshot_on_failure() {
        let list = RefCell::new(vec![1, 2, 3]);
        let reconciled = RefCell::new(false);

        let result: Result<(), SyncError> = block_on(run_optimistic(
            || {
                let snapshot = list.borrow().clone();
                list.borrow_mut().retain(|n| *n != 2);
                snapshot
            },
            |_| async { Err(SyncError::Decode("boom".into())) },
            |snapshot| {
                *list.borrow_mut() = snapshot;
                async {}
            },
            |_| *reconciled.borrow_mut() = true,
        ));

        assert!(result.is_err());
        assert_eq!(*list.borrow(), vec![1, 2, 3]);
        assert!(!*reconciled.borrow());
    }

    #[test]
    fn test_reconcile_sees_result() {
        let seen = RefCell::new(None);
        let result = block_on(run_optimistic(
            || 41_i32,
            |base| {
                let next = *base + 1;
                async move { Ok::<_, SyncError>(next) }
            },
            |_| async {},
            |value: &i32| *seen.borrow_mut() = Some(*value),
        ));
        assert_eq!(result, Ok(42));
        assert_eq!(*seen.borrow(), Some(42));
    }
}
