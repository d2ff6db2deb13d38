use std::path::Path;
use std::time::Duration;

use noisepipe_core::{DEFAULT_ENDPOINT, Result};
use noisepipe_server::BrokerClient;

/// Everything `info` reports about a running broker.
#[derive(Debug)]
struct BrokerInfo {
    serial_number: String,
    model: String,
    device_version: (u32, u32),
    server_version: (u32, u32),
    self_test: u32,
}

fn query(client: &mut BrokerClient) -> Result<BrokerInfo> {
    Ok(BrokerInfo {
        serial_number: client.serial_number()?,
        model: client.model()?,
        device_version: client.device_version()?,
        server_version: client.server_version()?,
        self_test: client.self_test()?,
    })
}

fn to_json(endpoint: &Path, info: &BrokerInfo) -> serde_json::Value {
    serde_json::json!({
        "endpoint": endpoint.display().to_string(),
        "serial_number": info.serial_number,
        "model": info.model,
        "firmware_version": format!("{}.{}", info.device_version.0, info.device_version.1),
        "server_version": format!("{}.{}", info.server_version.0, info.server_version.1),
        "self_test_code": info.self_test,
        "self_test_passed": info.self_test == 0,
    })
}

pub fn run(endpoint: Option<&Path>, json: bool) {
    let endpoint = endpoint.unwrap_or(Path::new(DEFAULT_ENDPOINT));
    let mut client =
        BrokerClient::connect(endpoint).unwrap_or_else(|e| super::fail("connecting", e));
    if let Err(e) = client.set_timeout(Some(Duration::from_secs(30))) {
        super::fail("connecting", e);
    }
    let info = query(&mut client).unwrap_or_else(|e| super::fail("querying broker", e));

    if json {
        match serde_json::to_string_pretty(&to_json(endpoint, &info)) {
            Ok(text) => println!("{text}"),
            Err(e) => super::fail("encoding JSON", e),
        }
        return;
    }

    println!("Broker at {}", endpoint.display());
    println!("   server:    v{}.{}", info.server_version.0, info.server_version.1);
    println!("   model:     {}", info.model);
    println!("   serial:    {}", info.serial_number);
    println!(
        "   firmware:  {}.{}",
        info.device_version.0, info.device_version.1
    );
    if info.self_test == 0 {
        println!("   self-test: passed");
    } else {
        println!("   self-test: FAILED (code {:#04x})", info.self_test);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_report_shape() {
        let info = BrokerInfo {
            serial_number: "QR-42".into(),
            model: "TRNG".into(),
            device_version: (1, 3),
            server_version: (0, 6),
            self_test: 0x2,
        };
        let value = to_json(Path::new("/tmp/np.sock"), &info);
        assert_eq!(value["endpoint"], "/tmp/np.sock");
        assert_eq!(value["firmware_version"], "1.3");
        assert_eq!(value["server_version"], "0.6");
        assert_eq!(value["self_test_code"], 2);
        assert_eq!(value["self_test_passed"], false);
    }
}
