/// External checks of the on-disk formats: the container record
/// (`config.json`), the bidirectional map files and the IPAM store. These
/// mirror the formats other tooling may depend on; the behavioural tests
/// live inline next to the modules.

use std::collections::HashMap;

#[derive(serde::Serialize, serde::Deserialize, Debug)]
struct ContainerRecord {
    pid: String,
    id: String,
    name: String,
    image: String,
    command: String,
    volume: String,
    #[serde(rename = "createTime")]
    create_time: String,
    status: String,
    network_name: String,
    ip_address: String,
    port_mapping: Vec<String>,
}

#[test]
fn record_json_round_trip() {
    let json = r#"{
        "pid": "4242",
        "id": "1234567890",
        "name": "web",
        "image": "nginx@1.20",
        "command": "nginx -g daemon off;",
        "volume": "",
        "createTime": "2026-08-01 12:00:00",
        "status": "running",
        "network_name": "xdocker0",
        "ip_address": "192.168.10.2",
        "port_mapping": ["8080:80"]
    }"#;

    let record: ContainerRecord = serde_json::from_str(json).unwrap();
    assert_eq!(record.pid, "4242");
    assert_eq!(record.id, "1234567890");
    assert_eq!(record.create_time, "2026-08-01 12:00:00");
    assert_eq!(record.port_mapping, vec!["8080:80"]);

    let back = serde_json::to_string(&record).unwrap();
    assert!(back.contains("\"createTime\""));
    assert!(back.contains("\"network_name\""));
    assert!(back.contains("\"ip_address\""));
}

#[test]
fn record_accepts_all_statuses() {
    for status in ["running", "paused", "stop", "exited"] {
        let json = format!(
            r#"{{
                "pid": "",
                "id": "0000000000",
                "name": "c",
                "image": "busybox@latest",
                "command": "top",
                "volume": "",
                "createTime": "2026-08-01 00:00:00",
                "status": "{status}",
                "network_name": "",
                "ip_address": "",
                "port_mapping": []
            }}"#
        );
        let record: ContainerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record.status, status);
    }
}

#[test]
fn map_files_are_flat_string_dictionaries() {
    let json = r#"{"web":"1234567890","db":"0987654321"}"#;
    let name_to_id: HashMap<String, String> = serde_json::from_str(json).unwrap();
    assert_eq!(name_to_id["web"], "1234567890");

    // The inverse map uses the same shape with keys and values swapped.
    let inverted: HashMap<String, String> = name_to_id
        .iter()
        .map(|(name, id)| (id.clone(), name.clone()))
        .collect();
    assert_eq!(inverted["1234567890"], "web");
}

#[test]
fn ipam_store_maps_cidr_to_bitmap() {
    let json = r#"{"192.168.10.0/24":"0110"}"#;
    let store: HashMap<String, String> = serde_json::from_str(json).unwrap();
    let bitmap = &store["192.168.10.0/24"];
    assert!(bitmap.bytes().all(|b| b == b'0' || b == b'1'));
}
