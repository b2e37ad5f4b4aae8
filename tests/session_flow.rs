use balance_tuner::gains::GainVector;
use balance_tuner::search::{SearchConfig, SearchPhase, StopReason};
use balance_tuner::session::TuningSession;
use balance_tuner::telemetry::{Reading, TelemetryLink};
use balance_tuner::udp_link::UdpTelemetryLink;
use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Robot stand-in: wobble shrinks as K2 approaches 30.
struct SimulatedRobot {
    queue: Mutex<VecDeque<Reading>>,
    sent: Mutex<Vec<GainVector>>,
}

impl SimulatedRobot {
    fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), sent: Mutex::new(Vec::new()) }
    }

    fn respond(gains: &GainVector) -> Vec<Reading> {
        let wobble = 0.5 + (gains.k2 - 30.0).abs() * 0.1;
        (0..120).map(|i| if i % 2 == 0 { wobble } else { -wobble }).collect()
    }
}

impl TelemetryLink for SimulatedRobot {
    fn send_gains(&self, gains: &GainVector) {
        self.sent.lock().unwrap().push(*gains);
    }

    fn receive_latest(&self, timeout: Duration) -> Option<Reading> {
        let r = self.queue.lock().unwrap().pop_front();
        if r.is_none() {
            thread::sleep(timeout);
        }
        r
    }

    fn discard_pending(&self) -> usize {
        let mut q = self.queue.lock().unwrap();
        let n = q.len();
        q.clear();
        if let Some(g) = self.sent.lock().unwrap().last() {
            q.extend(Self::respond(g));
        }
        n
    }

    fn device(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([10, 0, 0, 7], 4210)))
    }
}

fn quick_config(max_rounds: u32) -> SearchConfig {
    SearchConfig {
        trial_duration: Duration::from_millis(25),
        baseline_settle: Duration::ZERO,
        probe_settle: Duration::ZERO,
        max_rounds,
        ..SearchConfig::default()
    }
}

#[test]
fn test_session_climbs_towards_better_damping() {
    let robot = Arc::new(SimulatedRobot::new());
    let session = TuningSession::new(robot.clone(), quick_config(30))
        .with_seed(2024)
        .with_poll_interval(Duration::from_millis(5));

    assert!(session.start());
    let outcome = session.wait().expect("search result");

    assert!(outcome.best_gains.k2 > 24.0, "best {:?}", outcome.best_gains);
    assert!(outcome.best_score > outcome.results[0].score);
    assert!(outcome.trials <= 30);
    assert_eq!(robot.sent.lock().unwrap().last(), Some(&outcome.best_gains));

    let snap = session.snapshot();
    assert!(!snap.active);
    assert!(matches!(snap.phase, SearchPhase::Converged | SearchPhase::Exhausted));
    assert_eq!(snap.results, outcome.results);

    let space = SearchConfig::default().space;
    assert!(outcome.results.iter().all(|r| space.contains(&r.gains)));
}

#[test]
fn test_stop_mid_run_sends_best() {
    let robot = Arc::new(SimulatedRobot::new());
    let session = TuningSession::new(robot.clone(), quick_config(30))
        .with_seed(7)
        .with_poll_interval(Duration::from_millis(5));
    assert!(session.start());

    thread::sleep(Duration::from_millis(120));
    session.stop();
    let best_at_stop = session.snapshot().best_gains;
    let outcome = session.wait().expect("search result");

    assert_eq!(outcome.best_gains, best_at_stop);
    assert_eq!(robot.sent.lock().unwrap().last(), Some(&best_at_stop));
    if outcome.reason == StopReason::Stopped {
        assert_eq!(session.snapshot().phase, SearchPhase::Stopped);
    }
}

/// Fake robot on loopback: streams angles and records the last gain message it got.
fn spawn_udp_robot(
    socket: UdpSocket,
    tuner: SocketAddr,
    running: Arc<AtomicBool>,
) -> (Arc<Mutex<Option<String>>>, thread::JoinHandle<()>) {
    socket.set_read_timeout(Some(Duration::from_millis(2))).unwrap();
    let last = Arc::new(Mutex::new(None));
    let last_rx = Arc::clone(&last);
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 256];
        let mut tick = 0u32;
        while running.load(Ordering::Relaxed) {
            if let Ok((len, _)) = socket.recv_from(&mut buf) {
                let msg = String::from_utf8_lossy(&buf[..len]).to_string();
                *last_rx.lock().unwrap() = Some(msg);
                let _ = socket.send_to(b"KACK", tuner);
            }
            let angle = if tick % 2 == 0 { 0.7 } else { -0.7 };
            let _ = socket.send_to(format!("{:.2},{}", angle, 90 + tick % 10).as_bytes(), tuner);
            tick = tick.wrapping_add(1);
        }
    });
    (last, handle)
}

#[test]
fn test_udp_session_end_to_end() {
    let robot_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let robot_addr = robot_socket.local_addr().unwrap();

    let link = Arc::new(
        UdpTelemetryLink::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some(robot_addr),
            robot_addr.port(),
            Duration::from_millis(10),
            300,
        )
        .unwrap(),
    );
    let running = Arc::new(AtomicBool::new(true));
    let (last_msg, robot) = spawn_udp_robot(robot_socket, link.local_addr().unwrap(), Arc::clone(&running));

    let config = SearchConfig {
        trial_duration: Duration::from_millis(150),
        baseline_settle: Duration::from_millis(20),
        probe_settle: Duration::from_millis(20),
        max_rounds: 3,
        ..SearchConfig::default()
    };
    let session = TuningSession::new(link.clone(), config)
        .with_seed(1)
        .with_poll_interval(Duration::from_millis(10));
    assert!(session.start());
    let outcome = session.wait().expect("search result");

    // Let the final gain push arrive
    let deadline = Instant::now() + Duration::from_secs(2);
    let expected = outcome.best_gains.to_command();
    while last_msg.lock().unwrap().as_deref() != Some(expected.as_str()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    running.store(false, Ordering::Relaxed);
    robot.join().unwrap();

    assert_eq!(last_msg.lock().unwrap().as_deref(), Some(expected.as_str()));
    assert!(outcome.results[0].score > 0.0);
    assert!(link.stats().frames() > 0);
    assert!(link.stats().acks() > 0);
    assert_eq!(link.stats().malformed(), 0);
    assert!(link.history().iter().all(|f| f.motor.is_some()));
}
