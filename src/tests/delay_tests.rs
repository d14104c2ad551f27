#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::config::EngineOptions;
    use crate::controller::{LifecycleController, StopOutcome};
    use crate::test_helpers::PairBackend;

    fn running(nodes: u32, delay: Duration) -> (Arc<PairBackend>, LifecycleController<PairBackend>) {
        let backend = Arc::new(PairBackend::with_devices(nodes));
        let options = EngineOptions {
            status_interval: None,
            ..EngineOptions::default()
        };
        let mut controller = LifecycleController::new(backend.clone(), options);
        controller.start(delay, nodes).unwrap();
        (backend, controller)
    }

    #[test]
    fn test_frame_not_delivered_before_delay() {
        let delay = Duration::from_millis(100);
        let (backend, mut controller) = running(2, delay);

        let host0 = backend.host("tap0-ns").unwrap();
        let host1 = backend.host("tap1-ns").unwrap();

        let sent_at = Instant::now();
        host0.send(b"delayed").unwrap();

        let mut buf = [0u8; 64];
        let len = host1.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"delayed");
        assert!(
            sent_at.elapsed() >= delay,
            "arrived after {:?}",
            sent_at.elapsed()
        );

        let outcome = controller.stop().unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.totals.frames_rx, 1);
        assert_eq!(report.discarded, 0);
    }

    #[test]
    fn test_sender_does_not_hear_itself() {
        let (backend, _controller) = running(2, Duration::ZERO);

        let host0 = backend.host("tap0-ns").unwrap();
        let host1 = backend.host("tap1-ns").unwrap();
        host0.send(b"hello").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(host1.recv(&mut buf).unwrap(), 5);

        host0
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let err = host0.recv(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::WouldBlock | ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_empty_frame_does_not_detach_node() {
        let (backend, _controller) = running(2, Duration::ZERO);

        let host0 = backend.host("tap0-ns").unwrap();
        let host1 = backend.host("tap1-ns").unwrap();
        host0.send(b"").unwrap();
        host0.send(b"still attached").unwrap();

        let mut buf = [0u8; 64];
        let len = host1.recv(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"still attached");
    }

    #[test]
    fn test_frames_keep_order() {
        let (backend, _controller) = running(2, Duration::from_millis(10));

        let host0 = backend.host("tap0-ns").unwrap();
        let host1 = backend.host("tap1-ns").unwrap();
        for i in 0u8..20 {
            host0.send(&[i; 16]).unwrap();
        }

        let mut buf = [0u8; 64];
        for i in 0u8..20 {
            let len = host1.recv(&mut buf).unwrap();
            assert_eq!(&buf[..len], &[i; 16]);
        }
    }

    #[test]
    fn test_in_flight_frames_dropped_on_stop() {
        let (backend, mut controller) = running(3, Duration::from_secs(30));

        let host0 = backend.host("tap0-ns").unwrap();
        host0.send(b"never arrives").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        match controller.stop().unwrap() {
            StopOutcome::Stopped(report) => {
                assert_eq!(report.totals.frames_tx, 1);
                assert_eq!(report.discarded, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
