//! Batch synchronization over sets of requests.

use crate::request::{Request, RequestState};
use crate::switch::OnOffSwitch;
use std::sync::Arc;
use strata_common::{Result, StrataError};

/// Blocks until every request has completed.
///
/// All requests are waited for even when one of them failed; the first
/// failure in slice order is returned afterwards.
pub fn wait_all(requests: &[Request]) -> Result<()> {
    let mut first_error = None;
    for request in requests {
        if let Err(e) = request.wait() {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Blocks until at least one request has completed and returns its index.
///
/// One switch is registered with every request; the first completer turns
/// it on. A request that is already complete at registration time returns
/// immediately.
pub fn wait_any(requests: &[Request]) -> Result<usize> {
    if requests.is_empty() {
        return Err(StrataError::invalid_parameter("requests", "empty set"));
    }

    let switch = Arc::new(OnOffSwitch::default());
    let mut registered = 0;
    let mut done = None;
    for (i, request) in requests.iter().enumerate() {
        if request.add_waiter(&switch) {
            done = Some(i);
            break;
        }
        registered = i + 1;
    }

    let index = match done {
        Some(i) => i,
        None => {
            switch.wait_for_on();
            requests
                .iter()
                .position(|r| r.state() != RequestState::Operating)
                .ok_or_else(|| {
                    StrataError::Internal("switch turned on with no completed request".to_string())
                })?
        }
    };

    for request in &requests[..registered] {
        request.delete_waiter(&switch);
    }

    requests[index].poll()?;
    Ok(index)
}

/// Non-blocking variant of [`wait_any`]: the index of some completed
/// request, or `None` if every request is still operating.
pub fn poll_any(requests: &[Request]) -> Result<Option<usize>> {
    for (i, request) in requests.iter().enumerate() {
        if request.poll()? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_queue::DiskQueue;
    use crate::file::{FileBackend, MemoryFile, StorageFile};
    use crate::request::RequestKind;
    use strata_common::PriorityOp;

    fn storage(disk: u32) -> StorageFile {
        let backend: Arc<dyn FileBackend> = Arc::new(MemoryFile::new(disk, disk));
        let queue = Arc::new(DiskQueue::new(disk, PriorityOp::None).unwrap());
        StorageFile::new(backend, queue).unwrap()
    }

    #[test]
    fn test_wait_all_completes_every_request() {
        let file = storage(0);
        let requests: Vec<Request> = (0..16)
            .map(|i| file.awrite(vec![i as u8; 256], i * 256, None).unwrap())
            .collect();

        wait_all(&requests).unwrap();
        for request in &requests {
            assert!(request.poll().unwrap());
            assert_eq!(request.kind(), RequestKind::Write);
        }
    }

    #[test]
    fn test_wait_all_reports_failure_after_waiting() {
        let file = storage(0);
        let good = file.awrite(vec![1u8; 64], 0, None).unwrap();
        let bad = file.aread(vec![0u8; 64], 1 << 20, None).unwrap();
        let also_good = file.awrite(vec![2u8; 64], 64, None).unwrap();

        let result = wait_all(&[good.clone(), bad, also_good.clone()]);
        assert!(matches!(result, Err(StrataError::RequestFailed { .. })));
        assert!(good.poll().unwrap());
        assert!(also_good.poll().unwrap());
    }

    #[test]
    fn test_wait_any_returns_completed_index() {
        let a = storage(0);
        let b = storage(1);
        let requests = vec![
            a.awrite(vec![0u8; 4096], 0, None).unwrap(),
            b.awrite(vec![0u8; 4096], 0, None).unwrap(),
        ];

        let index = wait_any(&requests).unwrap();
        assert!(index < requests.len());
        assert!(requests[index].poll().unwrap());
        wait_all(&requests).unwrap();
    }

    #[test]
    fn test_wait_any_short_circuits_on_done_request() {
        let file = storage(0);
        let first = file.awrite(vec![0u8; 16], 0, None).unwrap();
        first.wait().unwrap();
        let second = file.awrite(vec![0u8; 16], 16, None).unwrap();

        assert_eq!(wait_any(&[first, second.clone()]).unwrap(), 0);
        second.wait().unwrap();
    }

    #[test]
    fn test_wait_any_empty_set() {
        assert!(wait_any(&[]).is_err());
    }

    #[test]
    fn test_poll_any() {
        assert_eq!(poll_any(&[]).unwrap(), None);

        let file = storage(0);
        let request = file.awrite(vec![0u8; 16], 0, None).unwrap();
        request.wait().unwrap();
        assert_eq!(poll_any(&[request]).unwrap(), Some(0));
    }
}
