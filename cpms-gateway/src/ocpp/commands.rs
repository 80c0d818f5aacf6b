//! Central-system-initiated commands
//!
//! A [`ChargerCommand`] is the typed form of an outbound CALL. The command
//! intake builds one from a loosely typed `{action, params}` pair; the typed
//! dispatcher operations build one directly.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::messages::Action;
use super::types::*;
use crate::error::CommandError;

#[derive(Debug, Clone, PartialEq)]
pub enum ChargerCommand {
    RemoteStartTransaction(RemoteStartTransactionRequest),
    RemoteStopTransaction(RemoteStopTransactionRequest),
    Reset(ResetRequest),
    UnlockConnector(UnlockConnectorRequest),
    ChangeConfiguration(ChangeConfigurationRequest),
    GetConfiguration(GetConfigurationRequest),
    GetDiagnostics(GetDiagnosticsRequest),
    UpdateFirmware(UpdateFirmwareRequest),
}

impl ChargerCommand {
    /// Build a command from an action name and its JSON parameters
    pub fn from_parts(action: &str, params: Value) -> Result<Self, CommandError> {
        let action: Action = action
            .parse()
            .map_err(|_| CommandError::UnknownAction(action.to_string()))?;

        // Absent params mean "no parameters"
        let params = if params.is_null() { json!({}) } else { params };

        let command = match action {
            Action::RemoteStartTransaction => {
                ChargerCommand::RemoteStartTransaction(decode(action, params)?)
            }
            Action::RemoteStopTransaction => {
                ChargerCommand::RemoteStopTransaction(decode(action, params)?)
            }
            Action::Reset => ChargerCommand::Reset(decode(action, params)?),
            Action::UnlockConnector => ChargerCommand::UnlockConnector(decode(action, params)?),
            Action::ChangeConfiguration => {
                ChargerCommand::ChangeConfiguration(decode(action, params)?)
            }
            Action::GetConfiguration => ChargerCommand::GetConfiguration(decode(action, params)?),
            Action::GetDiagnostics => ChargerCommand::GetDiagnostics(decode(action, params)?),
            Action::UpdateFirmware => ChargerCommand::UpdateFirmware(decode(action, params)?),
            // Charger-initiated actions are never sent by the central system
            other => return Err(CommandError::UnknownAction(other.to_string())),
        };

        Ok(command)
    }

    pub fn action(&self) -> Action {
        match self {
            ChargerCommand::RemoteStartTransaction(_) => Action::RemoteStartTransaction,
            ChargerCommand::RemoteStopTransaction(_) => Action::RemoteStopTransaction,
            ChargerCommand::Reset(_) => Action::Reset,
            ChargerCommand::UnlockConnector(_) => Action::UnlockConnector,
            ChargerCommand::ChangeConfiguration(_) => Action::ChangeConfiguration,
            ChargerCommand::GetConfiguration(_) => Action::GetConfiguration,
            ChargerCommand::GetDiagnostics(_) => Action::GetDiagnostics,
            ChargerCommand::UpdateFirmware(_) => Action::UpdateFirmware,
        }
    }

    /// CALL payload
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            ChargerCommand::RemoteStartTransaction(req) => serde_json::to_value(req),
            ChargerCommand::RemoteStopTransaction(req) => serde_json::to_value(req),
            ChargerCommand::Reset(req) => serde_json::to_value(req),
            ChargerCommand::UnlockConnector(req) => serde_json::to_value(req),
            ChargerCommand::ChangeConfiguration(req) => serde_json::to_value(req),
            ChargerCommand::GetConfiguration(req) => serde_json::to_value(req),
            ChargerCommand::GetDiagnostics(req) => serde_json::to_value(req),
            ChargerCommand::UpdateFirmware(req) => serde_json::to_value(req),
        }
    }
}

fn decode<T: DeserializeOwned>(action: Action, params: Value) -> Result<T, CommandError> {
    serde_json::from_value(params).map_err(|e| CommandError::InvalidParams {
        action,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_from_parts() {
        let cmd = ChargerCommand::from_parts("Reset", json!({"type": "Soft"})).unwrap();
        assert_eq!(
            cmd,
            ChargerCommand::Reset(ResetRequest {
                reset_type: ResetType::Soft
            })
        );
        assert_eq!(cmd.action(), Action::Reset);
        assert_eq!(cmd.payload().unwrap(), json!({"type": "Soft"}));
    }

    #[test]
    fn test_get_configuration_without_params() {
        let cmd = ChargerCommand::from_parts("GetConfiguration", Value::Null).unwrap();
        assert_eq!(cmd.payload().unwrap(), json!({}));
    }

    #[test]
    fn test_unknown_and_inbound_actions_rejected() {
        let err = ChargerCommand::from_parts("SelfDestruct", json!({})).unwrap_err();
        assert_eq!(err.code(), "UnknownCommandAction");

        let err = ChargerCommand::from_parts("Heartbeat", json!({})).unwrap_err();
        assert_eq!(err.code(), "UnknownCommandAction");
    }

    #[test]
    fn test_invalid_params() {
        let err = ChargerCommand::from_parts("Reset", json!({"type": "Sideways"})).unwrap_err();
        assert_eq!(err.code(), "InvalidParams");

        let err = ChargerCommand::from_parts("UnlockConnector", json!({})).unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidParams {
                action: Action::UnlockConnector,
                ..
            }
        ));
    }

    #[test]
    fn test_update_firmware_dates() {
        let cmd = ChargerCommand::from_parts(
            "UpdateFirmware",
            json!({"location": "https://fw.example/cp.bin", "retrieveDate": "2026-02-01T00:00:00Z", "retries": 3}),
        )
        .unwrap();

        let payload = cmd.payload().unwrap();
        assert_eq!(payload["location"], "https://fw.example/cp.bin");
        assert_eq!(payload["retries"], 3);
        assert!(payload.get("retryInterval").is_none());
    }
}
