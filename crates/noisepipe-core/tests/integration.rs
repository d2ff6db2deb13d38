//! Integration tests for noisepipe-core.
//!
//! These drive the public API end to end: a serial device talking to firmware
//! on the far side of a socket pair, conditioning and health checks on its
//! output, and sampling from it.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use noisepipe_core::device::encode_ident;
use noisepipe_core::{
    BrokerConfig, Conditioner, DeviceChannel, DeviceSession, DirectoryEnumerator, EntropyDevice,
    EntropyReader, Error, HealthMonitor, NoiseSource, PostProcessing, SerialDevice,
    UniqueSequenceSampler, diagnose, sample,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Firmware double serving command frames on its end of a socket pair.
/// Returns the number of frames handled once the host hangs up.
fn spawn_firmware(mut wire: UnixStream, seed: u64) -> JoinHandle<usize> {
    std::thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut frame = [0u8; 5];
        let mut handled = 0;
        while wire.read_exact(&mut frame).is_ok() {
            handled += 1;
            let arg = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
            let reply = match frame[0] {
                b'x' | b'1' | b'2' => {
                    let mut data = vec![0u8; arg as usize];
                    rng.fill_bytes(&mut data);
                    data
                }
                b'd' => vec![0],
                b'n' => encode_ident("NP0001").to_vec(),
                b'm' => encode_ident("NoisePipe TRNG").to_vec(),
                b'v' => vec![1, 4],
                b'p' | b'c' => vec![0],
                _ => Vec::new(),
            };
            if wire.write_all(&reply).is_err() {
                break;
            }
        }
        handled
    })
}

fn connected_device(seed: u64) -> (SerialDevice, JoinHandle<usize>) {
    let (host, firmware) = UnixStream::pair().unwrap();
    let fw = spawn_firmware(firmware, seed);
    let mut channel = DeviceChannel::new();
    channel.attach("/dev/np-test", Box::new(host));
    (SerialDevice::from_channel(channel), fw)
}

#[test]
fn device_lifecycle_over_a_real_stream() {
    let (mut device, fw) = connected_device(1);
    device.configure(&DeviceSession::default()).unwrap();

    let info = device.info().unwrap();
    assert_eq!(info.serial_number, "NP0001");
    assert_eq!(info.model, "NoisePipe TRNG");
    assert_eq!((info.major_version, info.minor_version), (1, 4));

    let mut buf = vec![0u8; 40_000];
    device.entropy(&mut buf).unwrap();
    device.noise(NoiseSource::Second, &mut buf[..100]).unwrap();

    let report = device.self_test().unwrap();
    assert!(report.passed(), "{report:?}");
    assert_eq!(report.code(), 0);

    device.close();
    assert!(!device.channel().is_connected());
    assert!(device.entropy(&mut buf[..4]).is_err());
    // configure 2, info 3, entropy 3 chunks, noise 1, diagnostics 2
    drop(device);
    assert_eq!(fw.join().unwrap(), 11);
}

#[test]
fn conditioned_output_passes_continuous_health_tests() {
    let (mut device, _fw) = connected_device(2);
    let mut monitor = HealthMonitor::new();
    let conditioner = Conditioner::new(PostProcessing::Sha256);

    for _ in 0..8 {
        let mut raw = vec![0u8; 4096];
        device.entropy(&mut raw).unwrap();
        monitor.check(&raw).unwrap();
        let out = conditioner.condition(&raw, raw.len());
        assert_eq!(out.len(), raw.len());
    }
    assert_eq!(monitor.failures(), 0);

    let words = device.read_words(4096).unwrap();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    assert!(diagnose(&bytes).passed());
}

#[test]
fn sampler_draws_from_a_device() {
    let (mut device, _fw) = connected_device(3);
    let mut sampler = UniqueSequenceSampler::new(1000).unwrap();
    for size in [1, 10, 500, 1000] {
        let mut out = sampler.generate(size, &mut device).unwrap();
        assert_eq!(out.len(), size);
        out.sort_unstable();
        out.dedup();
        assert_eq!(out.len(), size);
        assert!(out.iter().all(|v| (1..=1000).contains(v)));
    }

    // Through the trait object, as the broker holds it.
    let dynamic: &mut dyn EntropyDevice = &mut device;
    let draw = sample(49, 6, dynamic).unwrap();
    assert_eq!(draw.len(), 6);
}

#[test]
fn sampler_stops_on_device_failure() {
    let (host, firmware) = UnixStream::pair().unwrap();
    drop(firmware);
    let mut channel = DeviceChannel::new();
    channel.attach("/dev/np-gone", Box::new(host));
    let mut device = SerialDevice::from_channel(channel);

    let mut sampler = UniqueSequenceSampler::new(10).unwrap();
    assert!(sampler.generate(5, &mut device).is_err());
}

#[test]
fn config_file_drives_session_and_device_selection() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["ttyACM1", "ttyACM0", "ttyS0"] {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    let enumerator = DirectoryEnumerator::with_prefix(dir.path(), "ttyACM");
    let found: Vec<_> = DeviceChannel::discover_with(&enumerator).into_iter().collect();
    assert_eq!(found, vec![dir.path().join("ttyACM0"), dir.path().join("ttyACM1")]);

    let config_path = dir.path().join("broker.json");
    std::fs::write(
        &config_path,
        format!(
            r#"{{
                "device_path": "{}",
                "pool_size": 3,
                "power_profile": 4,
                "post_processing_enabled": false,
                "embedded_correction": "linear",
                "receive_deadline_ms": 2500
            }}"#,
            found[1].display()
        ),
    )
    .unwrap();

    let config = BrokerConfig::from_file(&config_path).unwrap();
    assert_eq!(config.resolve_device_path().unwrap(), found[1]);
    assert_eq!(config.receive_deadline().unwrap().as_millis(), 2500);
    let session = config.session().unwrap();
    assert_eq!(session.post_processing, None);
    assert_eq!(session.power_profile.level(), 4);
    assert!(session.self_test);

    // A plain file is not a serial line: the open fails and releases the lock.
    assert!(matches!(
        SerialDevice::open(&found[1], None),
        Err(Error::Io(_))
    ));
}

#[test]
fn missing_device_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        SerialDevice::open(dir.path().join("ttyACM9"), None),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn independent_samplers_share_one_device_via_a_lock() {
    struct Shared {
        device: Arc<std::sync::Mutex<SerialDevice>>,
        reads: Arc<AtomicUsize>,
    }
    impl EntropyReader for Shared {
        fn read_entropy(&mut self, buf: &mut [u8]) -> noisepipe_core::Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let mut device = self.device.lock().unwrap();
            device.entropy(buf)
        }
    }

    let (device, _fw) = connected_device(4);
    let device = Arc::new(std::sync::Mutex::new(device));
    let reads = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..3)
        .map(|_| {
            let mut source = Shared {
                device: Arc::clone(&device),
                reads: Arc::clone(&reads),
            };
            std::thread::spawn(move || {
                let mut out = sample(200, 200, &mut source).unwrap();
                out.sort_unstable();
                assert_eq!(out, (1..=200).collect::<Vec<_>>());
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(reads.load(Ordering::SeqCst) >= 3);
}
