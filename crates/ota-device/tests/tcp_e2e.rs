//! Updates over a real loopback TCP socket
//!
//! Run with: cargo test -p ota-device --test tcp_e2e

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ota_core::{
    ChunkFrame, DeviceFrame, ImageDigest, ResponseStatus, SenderFrame, UpdateRequest,
    UpdateStatus,
};
use ota_device::{DeviceConfig, SimulatedDevice};
use ota_engine::{BootPhase, Slot};

const CHUNK: usize = 256;

struct RunningDevice {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<SimulatedDevice>,
}

impl RunningDevice {
    fn start() -> Self {
        let mut config = DeviceConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..DeviceConfig::default()
        };
        config.engine.port = 0;
        config.health.delay_ms = 0;

        let mut device = SimulatedDevice::start(config).unwrap();
        let port = device.port();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                device.tick().unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            device
        });

        Self { port, stop, handle }
    }

    fn stop(self) -> SimulatedDevice {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap()
    }
}

struct Sender {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Sender {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, frame: &SenderFrame) {
        self.stream.write_all(&frame.encode().unwrap()).unwrap();
    }

    /// Block until the next device frame arrives.
    fn next_frame(&mut self) -> DeviceFrame {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some((frame, used)) = DeviceFrame::decode(&self.buf).unwrap() {
                self.buf.drain(..used);
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame from device");

            let mut chunk = [0u8; 512];
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!("device closed the connection"),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {}", e),
            }
        }
    }

    /// Skip ACKs until the final RESULT.
    fn result(&mut self) -> UpdateStatus {
        loop {
            match self.next_frame() {
                DeviceFrame::Ack(_) => continue,
                DeviceFrame::Result(status) => return status,
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn upload(sender: &mut Sender, request: UpdateRequest, image: &[u8]) -> UpdateStatus {
    sender.send(&SenderFrame::Request(request));
    match sender.next_frame() {
        DeviceFrame::Response(response) => assert_eq!(response.status, ResponseStatus::Ok),
        other => panic!("expected response, got {:?}", other),
    }

    for (i, chunk) in image.chunks(CHUNK).enumerate() {
        sender.send(&SenderFrame::Chunk(ChunkFrame {
            offset: (i * CHUNK) as u32,
            payload: chunk.to_vec(),
        }));
    }
    sender.send(&SenderFrame::End);
    sender.result()
}

#[test]
fn test_update_over_tcp() {
    let device = RunningDevice::start();
    let image = image(10_000);

    let mut sender = Sender::connect(device.port);
    let status = upload(&mut sender, UpdateRequest::for_image(&image), &image);
    assert_eq!(status, UpdateStatus::Success);

    // Reboot and health check happen on the following ticks
    thread::sleep(Duration::from_millis(200));
    let device = device.stop();

    assert_eq!(device.boots(), 2);
    let report = device.report().unwrap();
    assert_eq!(report.active_slot, Slot::B);
    assert_eq!(report.boot_phase, BootPhase::Confirmed);
    let running = report.running_image.unwrap();
    assert_eq!(running.digest, ImageDigest::of(&image));
    assert_eq!(running.size, image.len() as u32);
}

#[test]
fn test_wrong_digest_over_tcp() {
    let device = RunningDevice::start();
    let image = image(4096);
    let mut request = UpdateRequest::for_image(&image);
    request.digest = ImageDigest::of(b"something else");

    let mut sender = Sender::connect(device.port);
    let status = upload(&mut sender, request, &image);
    assert_eq!(status, UpdateStatus::VerifyFailed);

    thread::sleep(Duration::from_millis(50));
    let device = device.stop();

    assert_eq!(device.boots(), 1);
    let report = device.report().unwrap();
    assert_eq!(report.active_slot, Slot::A);
    assert_eq!(report.running_image, None);
    assert_eq!(report.last_outcome, Some(UpdateStatus::VerifyFailed));
}
