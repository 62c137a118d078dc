use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::amount::DisplayAmount;
use crate::error::{ClientError, Result};
use crate::signer::is_valid_address;

pub const SUDO_MODULE: &str = "Sudo";

/// A typed call argument. Amounts are always given in display units and
/// converted to base units exactly once, when the payload is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CallArg {
    Amount(DisplayAmount),
    Int(u64),
    Text(String),
    Address(String),
    List(Vec<CallArg>),
    Call(Box<Call>),
    Weight(u64, u64),
}

impl CallArg {
    fn to_payload(&self, name: &str) -> Result<Value> {
        Ok(match self {
            CallArg::Amount(amount) => json!(amount.to_base_units().ok_or_else(|| {
                ClientError::invalid(name, format!("{} is not a valid amount", amount.tokens()))
            })?),
            CallArg::Int(v) => json!(v),
            CallArg::Text(s) => json!(s),
            CallArg::Address(a) => {
                if !is_valid_address(a) {
                    return Err(ClientError::UnknownAddress(a.clone()));
                }
                json!(a)
            }
            CallArg::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.to_payload(name))
                    .collect::<Result<_>>()?,
            ),
            CallArg::Call(call) => call.to_payload()?,
            CallArg::Weight(ref_time, proof_size) => json!([ref_time, proof_size]),
        })
    }
}

impl From<DisplayAmount> for CallArg {
    fn from(amount: DisplayAmount) -> Self {
        CallArg::Amount(amount)
    }
}

impl From<u64> for CallArg {
    fn from(v: u64) -> Self {
        CallArg::Int(v)
    }
}

impl From<&str> for CallArg {
    fn from(s: &str) -> Self {
        CallArg::Text(s.to_string())
    }
}

impl From<String> for CallArg {
    fn from(s: String) -> Self {
        CallArg::Text(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub params: BTreeMap<String, CallArg>,
}

impl Call {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, name: &str, value: impl Into<CallArg>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn amount(self, name: &str, tokens: f64) -> Self {
        self.arg(name, DisplayAmount::new(tokens))
    }

    pub fn address(self, name: &str, address: impl Into<String>) -> Self {
        self.arg(name, CallArg::Address(address.into()))
    }

    /// `Module.function`.
    pub fn describe(&self) -> String {
        format!("{}.{}", self.module, self.function)
    }

    /// Checks every argument without building the payload.
    pub fn validate(&self) -> Result<()> {
        self.to_payload().map(|_| ())
    }

    pub fn to_payload(&self) -> Result<Value> {
        if self.module.is_empty() || self.function.is_empty() {
            return Err(ClientError::invalid("call", "module and function are required"));
        }
        let mut args = Map::new();
        for (name, arg) in &self.params {
            args.insert(name.clone(), arg.to_payload(name)?);
        }
        Ok(json!({
            "call_module": self.module,
            "call_function": self.function,
            "call_args": args,
        }))
    }

    /// Wraps the call for privileged execution.
    pub fn sudo(self) -> Call {
        Call::new(SUDO_MODULE, "sudo").arg("call", CallArg::Call(Box::new(self)))
    }

    /// Wraps the call so the runtime skips its weight check.
    pub fn unchecked_weight(self) -> Call {
        Call::new(SUDO_MODULE, "sudo_unchecked_weight")
            .arg("call", CallArg::Call(Box::new(self)))
            .arg("weight", CallArg::Weight(0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEST: &str = "0x8f2a55949038a9610f50fb23b5883af3b4ecb3c3bb792cbcefbd1542c692be63";

    #[test]
    fn amounts_convert_once() {
        let payload = Call::new("Balances", "transfer")
            .address("dest", DEST)
            .amount("value", 5.0)
            .to_payload()
            .unwrap();
        assert_eq!(payload["call_args"]["value"], 5_000_000_000u64);
        assert_eq!(payload["call_args"]["dest"], DEST);
        assert_eq!(payload["call_module"], "Balances");
    }

    #[test]
    fn invalid_arguments_fail_fast() {
        let neg = Call::new("Balances", "transfer").amount("value", -1.0);
        assert!(neg.validate().unwrap_err().is_validation());
        let bad = Call::new("Balances", "transfer").address("dest", "not-an-address");
        assert!(matches!(bad.validate(), Err(ClientError::UnknownAddress(_))));
        assert!(Call::new("", "x").validate().is_err());
    }

    #[test]
    fn wrapping_nests_inner_call() {
        let inner = Call::new("SubspaceModule", "update_global").arg("burn_rate", 10u64);
        let wrapped = inner.clone().sudo().unchecked_weight();
        let payload = wrapped.to_payload().unwrap();
        assert_eq!(payload["call_function"], "sudo_unchecked_weight");
        assert_eq!(payload["call_args"]["weight"], json!([0, 0]));
        let sudo = &payload["call_args"]["call"];
        assert_eq!(sudo["call_function"], "sudo");
        assert_eq!(sudo["call_args"]["call"], inner.to_payload().unwrap());
    }

    #[test]
    fn lists_validate_each_item() {
        let call = Call::new("SubspaceModule", "set_weights")
            .arg("uids", CallArg::List(vec![1u64.into(), 2u64.into()]));
        assert_eq!(call.to_payload().unwrap()["call_args"]["uids"], json!([1, 2]));
        let bad = Call::new("SubspaceModule", "transfer_multiple").arg(
            "destinations",
            CallArg::List(vec![CallArg::Address("nope".into())]),
        );
        assert!(bad.validate().is_err());
    }
}
