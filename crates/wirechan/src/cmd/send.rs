use std::fs;
use std::sync::mpsc;
use std::time::Duration;

use serde_json::Value;
use wirechan_channel::{ChannelConfig, SocketChannel};
use wirechan_transport::WireAddr;

use crate::cmd::SendArgs;
use crate::exit::{channel_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let addr: WireAddr = args
        .addr
        .parse()
        .map_err(|err| CliError::new(USAGE, format!("bad address: {err}")))?;
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let config = ChannelConfig {
        connect_timeout,
        ..ChannelConfig::default()
    };
    let channel = SocketChannel::connect_with_config(&addr, config)
        .map_err(|err| channel_error("connect failed", err))?;

    // Register before sending so a fast responder cannot race the listener.
    let responses = args.wait.then(|| {
        let (tx, rx) = mpsc::channel::<Value>();
        channel.on_message(move |value| {
            let _ = tx.send(value.clone());
        });
        rx
    });

    channel
        .send(&payload)
        .map_err(|err| channel_error("send failed", err))?;
    if !channel.flush(wait_timeout) {
        return Err(CliError::new(TIMEOUT, "send did not reach the transport"));
    }

    if let Some(responses) = responses {
        let response = responses
            .recv_timeout(wait_timeout)
            .map_err(|_| CliError::new(TIMEOUT, "no response before timeout"))?;
        print_message(&response, &args.addr, format);
    }

    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Value> {
    if let Some(json) = &args.json {
        return serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")));
    }
    if let Some(data) = &args.data {
        return Ok(Value::String(data.clone()));
    }
    if let Some(path) = &args.file {
        let bytes = fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        })?;
        return serde_json::from_slice(&bytes).map_err(|err| {
            CliError::new(
                DATA_INVALID,
                format!("{} is not valid JSON: {err}", path.display()),
            )
        });
    }
    Err(CliError::new(
        USAGE,
        "one of --json, --data, or --file is required",
    ))
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with(json: Option<&str>, data: Option<&str>) -> SendArgs {
        SendArgs {
            addr: "127.0.0.1:0".to_string(),
            json: json.map(String::from),
            data: data.map(String::from),
            file: None,
            connect_timeout: "1s".to_string(),
            wait: false,
            wait_timeout: "5s".to_string(),
        }
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn payload_from_json_flag() {
        let payload = resolve_payload(&args_with(Some(r#"{"x":1}"#), None)).unwrap();
        assert_eq!(payload, serde_json::json!({"x": 1}));
    }

    #[test]
    fn payload_from_data_flag_is_a_json_string() {
        let payload = resolve_payload(&args_with(None, Some("hello"))).unwrap();
        assert_eq!(payload, Value::String("hello".to_string()));
    }

    #[test]
    fn missing_payload_is_a_usage_error() {
        let err = resolve_payload(&args_with(None, None)).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn invalid_json_flag_is_a_usage_error() {
        let err = resolve_payload(&args_with(Some("{nope"), None)).unwrap_err();
        assert_eq!(err.code, USAGE);
    }
}
