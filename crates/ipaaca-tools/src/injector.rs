//! Send one Message and report whether a listener on its category saw it

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use ipaaca_core::{DocumentMap, DocumentValue, EventMask, IpaacaResult, IuEventType};
use ipaaca_runtime::Handle;

use crate::args::IpaacaArgs;

/// Injects a Message of the given category with `key value` payload pairs
#[derive(Parser, Debug, Clone)]
#[command(name = "ipaaca-iu-injector", version)]
pub struct InjectorArgs {
    #[command(flatten)]
    pub ipaaca: IpaacaArgs,

    /// Category of the Message
    pub category: String,

    /// Alternating payload keys and values
    #[arg(value_name = "KEY VALUE")]
    pub pairs: Vec<String>,

    /// How long to wait for the Message to come back
    #[arg(long, default_value_t = 300, value_name = "MS")]
    pub wait_ms: u64,
}

/// Outcome of one injection
#[derive(Debug, Clone)]
pub struct InjectionReport {
    pub uid: String,
    pub category: String,
    pub payload: DocumentMap,
    /// Payload as received by the listener, if it arrived in time
    pub echoed: Option<DocumentMap>,
}

/// Pair up `key value` arguments; a trailing key without value is dropped
pub fn parse_pairs(pairs: &[String]) -> DocumentMap {
    if pairs.len() % 2 == 1 {
        warn!("ignoring payload key {:?} without a value", pairs[pairs.len() - 1]);
    }
    pairs
        .chunks_exact(2)
        .map(|kv| (kv[0].clone(), DocumentValue::String(kv[1].clone())))
        .collect()
}

pub fn inject(handle: &Handle, args: &InjectorArgs) -> IpaacaResult<InjectionReport> {
    let payload = parse_pairs(&args.pairs);
    let category = args.category.as_str();

    let received: Arc<(Mutex<Option<DocumentMap>>, Condvar)> = Arc::new(Default::default());
    let listener = handle.input_buffer("IUSniffer", &[category])?;
    let slot = Arc::clone(&received);
    listener.register_handler(
        move |unit, _, _| {
            *slot.0.lock() = Some(unit.payload().to_map());
            slot.1.notify_all();
        },
        EventMask::from(IuEventType::Message),
        Some(category),
    );

    let output = handle.output_buffer("IUInjector")?;
    let message = handle.new_message(category)?;
    message.payload().set_many(payload.clone())?;
    output.add(&message)?;
    info!("sent message {} on category {}", message.uid(), category);

    let echoed = {
        let mut guard = received.0.lock();
        received
            .1
            .wait_while_for(&mut guard, |slot| slot.is_none(), Duration::from_millis(args.wait_ms));
        guard.take()
    };
    listener.close();
    output.close();

    Ok(InjectionReport {
        uid: message.uid(),
        category: category.to_string(),
        payload,
        echoed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipaaca_core::{IpaacaConfig, PayloadType};

    fn args(argv: &[&str]) -> InjectorArgs {
        let mut full = vec!["ipaaca-iu-injector"];
        full.extend_from_slice(argv);
        InjectorArgs::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_parse_pairs() {
        let pairs: Vec<String> = ["a", "1", "b", "two", "dangling"].iter().map(|s| s.to_string()).collect();
        let map = parse_pairs(&pairs);
        assert_eq!(map.len(), 2);
        assert_eq!(map["a"], DocumentValue::from("1"));
        assert_eq!(map["b"], DocumentValue::from("two"));
    }

    #[test]
    fn test_inject_round_trip() {
        let parsed = args(&["--wait-ms", "2000", "greeting", "text", "hello"]);
        let handle = Handle::local(parsed.ipaaca.to_config()).unwrap();
        let report = inject(&handle, &parsed).unwrap();
        assert_eq!(report.category, "greeting");
        assert_eq!(report.echoed, Some(report.payload.clone()));
    }

    #[test]
    fn test_inject_with_map_payload_type() {
        let parsed = args(&["--ipaaca-payload-type", "MAP", "--wait-ms", "2000", "cat", "k", "v"]);
        let config = parsed.ipaaca.to_config();
        assert_eq!(config.payload_type, PayloadType::Map);
        let handle = Handle::local(config).unwrap();
        let report = inject(&handle, &parsed).unwrap();
        assert!(report.echoed.is_some());
    }

    #[test]
    fn test_empty_payload_is_echoed() {
        let parsed = args(&["--wait-ms", "50", "cat"]);
        let handle = Handle::local(IpaacaConfig::default()).unwrap();
        let report = inject(&handle, &parsed).unwrap();
        assert_eq!(report.echoed, Some(DocumentMap::new()));
    }
}
