use std::io::Write;

use replicast::{AppError, NodeConfig};
use tempfile::NamedTempFile;

const VALID: &str = r#"
[general]
server_id = 3
cluster_name = "blue"

[network]
ip = "127.0.0.1"
client_port = 7400
peer_port = 7401
max_connection = 8
max_package_size = 65536
send_queue_capacity = 32

[buffer_pool]
buffer_size = 1024

[rooms]
room_type_count = 4

[cluster]
shared_secret = "secret"
handshake_timeout_ms = 1000
reconnect_initial_backoff_ms = 10
reconnect_max_backoff_ms = 1000

[[cluster.peers]]
server_id = 4
address = "127.0.0.1:7411"

[[content_types]]
id = 10
name = "article"
opcode = 40
fields = ["u32:id", "cstr:title"]
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_valid_config() {
    let file = write_config(VALID);
    let config = NodeConfig::set_up_config(file.path()).unwrap();
    assert_eq!(config.general.server_id, 3);
    assert_eq!(config.general.cluster_name, "blue");
    assert_eq!(config.network.peer_port, 7401);
    assert_eq!(config.cluster.peers.len(), 1);
    assert_eq!(config.cluster.peers[0].address, "127.0.0.1:7411");
    assert_eq!(config.content_types[0].schema().unwrap().fields().len(), 3);
}

#[test]
fn test_control_opcode_for_content_is_rejected() {
    let file = write_config(&VALID.replace("opcode = 40", "opcode = 5"));
    assert!(matches!(
        NodeConfig::set_up_config(file.path()),
        Err(AppError::InvalidValue(_))
    ));
}

#[test]
fn test_bad_field_descriptor_is_rejected() {
    let file = write_config(&VALID.replace("cstr:title", "text:title"));
    assert!(NodeConfig::set_up_config(file.path()).is_err());
}

#[test]
fn test_zero_buffer_size_is_rejected() {
    let file = write_config(&VALID.replace("buffer_size = 1024", "buffer_size = 0"));
    assert!(matches!(
        NodeConfig::set_up_config(file.path()),
        Err(AppError::InvalidValue(_))
    ));
}

#[test]
fn test_duplicate_content_opcodes_are_rejected() {
    let duplicate = format!(
        "{}\n[[content_types]]\nid = 11\nname = \"comment\"\nopcode = 40\nfields = [\"u32:id\"]\n",
        VALID
    );
    let file = write_config(&duplicate);
    assert!(NodeConfig::set_up_config(file.path()).is_err());
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        NodeConfig::set_up_config("/nonexistent/replicast.toml"),
        Err(AppError::ConfigFileError(_))
    ));
}
