use std::path::Path;

use anyhow::{Result, anyhow};
use aya::maps::{Map, MapData, PerCpuHashMap, PerCpuValues};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value};

use proto_policer_common::{MAX_KEYS, PolicerInfo, PolicerTable, ProtocolKey};

/// Counters for one key summed over every execution context.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeyTotals {
    pub key: ProtocolKey,
    pub admitted: u128,
    pub dropped: u128,
    /// Contexts that have seen the key.
    pub contexts: usize,
    pub per_context: Vec<PolicerInfo>,
}

impl KeyTotals {
    fn new(key: ProtocolKey) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    fn add(&mut self, info: &PolicerInfo) {
        self.admitted = self.admitted.wrapping_add(info.admitted as u128);
        self.dropped = self.dropped.wrapping_add(info.dropped as u128);
        self.contexts += 1;
        self.per_context.push(*info);
    }
}

/// Sums a key's per-CPU values as read from the kernel map.
///
/// Unused CPUs hold zeroed values and are left out of `contexts`.
pub fn sum_per_cpu<'a, I>(key: ProtocolKey, values: I) -> KeyTotals
where
    I: IntoIterator<Item = &'a PolicerInfo>,
{
    let mut totals = KeyTotals::new(key);
    for info in values {
        if *info == PolicerInfo::default() {
            totals.per_context.push(*info);
            continue;
        }
        totals.add(info);
    }
    totals
}

/// Sums userspace context tables, key by key. Only reads the tables.
pub fn sum_tables<'a, I>(tables: I) -> Vec<KeyTotals>
where
    I: IntoIterator<Item = &'a PolicerTable>,
{
    let mut by_key: Vec<Option<KeyTotals>> = vec![None; MAX_KEYS as usize];
    for table in tables {
        for (key, info) in table.iter() {
            if let Some(slot) = by_key.get_mut(key.index()) {
                slot.get_or_insert_with(|| KeyTotals::new(key)).add(info);
            }
        }
    }
    by_key.into_iter().flatten().collect()
}

/// Reads and aggregates the pinned per-CPU state map.
pub fn read_pinned<P: AsRef<Path>>(pin_path: P) -> Result<Vec<KeyTotals>> {
    let pin = pin_path.as_ref();

    let map_data = MapData::from_pin(pin)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", pin.display(), e))?;
    let map_enum = Map::from_map_data(map_data).map_err(|e| anyhow!("invalid map type: {}", e))?;
    let per_cpu_map = PerCpuHashMap::<_, ProtocolKey, PolicerInfo>::try_from(map_enum)
        .map_err(|e| anyhow!("failed to convert to PerCpuHashMap: {}", e))?;

    let mut totals = Vec::new();
    for item in per_cpu_map.iter() {
        let (key, per_cpu_vals): (ProtocolKey, PerCpuValues<PolicerInfo>) =
            item.map_err(|e| anyhow!("aya iter error: {}", e))?;
        totals.push(sum_per_cpu(key, per_cpu_vals.iter()));
    }
    totals.sort_by_key(|t| t.key);
    Ok(totals)
}

pub fn to_json(totals: &[KeyTotals], per_cpu: bool) -> Value {
    let entries = totals
        .iter()
        .map(|t| {
            let mut obj = JsonMap::new();
            obj.insert("key".to_string(), Value::Number(JsonNumber::from(t.key.0)));
            obj.insert(
                "protocol".to_string(),
                Value::String(t.key.name().to_string()),
            );
            obj.insert("admitted".to_string(), value_from_u128(t.admitted));
            obj.insert("dropped".to_string(), value_from_u128(t.dropped));
            obj.insert(
                "contexts".to_string(),
                Value::Number(JsonNumber::from(t.contexts)),
            );
            if per_cpu {
                let cpus = t.per_context.iter().enumerate().map(|(cpu, info)| {
                    let mut cpu_obj = JsonMap::new();
                    cpu_obj.insert("cpu".to_string(), Value::Number(JsonNumber::from(cpu)));
                    cpu_obj.insert("budget".to_string(), Value::Number(info.budget.into()));
                    cpu_obj.insert("admitted".to_string(), Value::Number(info.admitted.into()));
                    cpu_obj.insert("dropped".to_string(), Value::Number(info.dropped.into()));
                    cpu_obj.insert(
                        "window_start_ns".to_string(),
                        Value::Number(info.window_start_ns.into()),
                    );
                    Value::Object(cpu_obj)
                });
                obj.insert("per_cpu".to_string(), Value::Array(cpus.collect()));
            }
            Value::Object(obj)
        })
        .collect();
    Value::Array(entries)
}

fn value_from_u128(n: u128) -> Value {
    if n <= u64::MAX as u128 {
        Value::Number(JsonNumber::from(n as u64))
    } else {
        Value::String(n.to_string())
    }
}
