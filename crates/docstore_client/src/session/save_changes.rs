//! Building and applying the save batch.

use super::{ConcurrencyCheckMode, DeletedEntity, DocumentInfo, DocumentSession};
use crate::compare_exchange::CompareExchangeSessionValue;
use crate::error::{ClientError, ClientResult};
use docstore_protocol::{
    BatchRequest, BatchResponse, BatchResultItem, CommandData, CommandMatcher, CommandType,
    CompareExchangeValue,
};
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

/// Commands a save would send, plus the staged compare-exchange state.
///
/// Produced by [`DocumentSession::prepare_for_save_changes`] without
/// touching the session.
#[derive(Debug, Clone)]
pub struct SaveChangesData {
    commands: Vec<CommandData>,
    session_commands: usize,
    staged_compare_exchange: IndexMap<String, CompareExchangeSessionValue>,
}

impl SaveChangesData {
    /// Returns the commands in send order.
    pub fn commands(&self) -> &[CommandData] {
        &self.commands
    }

    /// Returns how many leading commands the session generated itself.
    pub fn session_commands(&self) -> usize {
        self.session_commands
    }

    /// Returns `true` if nothing would be sent.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default)]
pub struct SaveChangesResult {
    /// Commands that were sent.
    pub commands: Vec<CommandData>,
    /// Per-command server results, in command order.
    pub results: Vec<BatchResultItem>,
}

impl SaveChangesResult {
    /// Returns `true` if no batch was sent.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl DocumentSession {
    /// Computes the batch a save would send. Does not modify the session.
    pub fn prepare_for_save_changes(&self) -> ClientResult<SaveChangesData> {
        let mut commands = Vec::new();

        for (id, deleted) in &self.deleted {
            if self.has_deferred(id, CommandMatcher::AnyCommand) {
                trace!(id = %id, "delete superseded by deferred command");
                continue;
            }
            commands.push(CommandData::delete(
                id.clone(),
                self.delete_change_vector(id, deleted),
            )?);
        }

        for (id, info) in &self.documents {
            if info.ignore_changes || self.deleted.contains_key(id) || !info.is_dirty() {
                continue;
            }
            if info.id.is_empty() {
                return Err(ClientError::illegal_state(
                    "a tracked entity changed but has no id",
                ));
            }
            if self.has_deferred(id, CommandMatcher::NotAttachment) {
                trace!(id = %id, "put superseded by deferred command");
                continue;
            }
            commands.push(CommandData::put(
                id.clone(),
                self.put_change_vector(info),
                info.entity.clone(),
                info.metadata.clone(),
            )?);
        }

        let mut staged_compare_exchange = self.compare_exchange.clone();
        for value in staged_compare_exchange.values_mut() {
            if let Some(command) = value.get_command()? {
                commands.push(command);
            }
        }

        let session_commands = commands.len();
        for command in self.deferred.values() {
            commands.push(self.with_tracked_change_vector(command.clone()));
        }

        Ok(SaveChangesData {
            commands,
            session_commands,
            staged_compare_exchange,
        })
    }

    /// Sends all pending changes as one atomic batch.
    ///
    /// On failure the session is unchanged and the save can be retried.
    pub fn save_changes(&mut self) -> ClientResult<SaveChangesResult> {
        if let Some(token) = &self.cancellation {
            token.check_cancelled()?;
        }
        let data = self.prepare_for_save_changes()?;
        if data.is_empty() {
            trace!(session = %self.id, "no changes to save");
            return Ok(SaveChangesResult::default());
        }

        self.before_request()?;
        debug!(
            session = %self.id,
            commands = data.commands.len(),
            deferred = data.commands.len() - data.session_commands,
            "saving changes"
        );
        let request = BatchRequest::new(data.commands.clone())
            .with_transaction_mode(self.transaction_mode);
        let response = match self.executor.batch(&request, Some(&self.session_info())) {
            Ok(response) => response,
            Err(error) => {
                warn!(session = %self.id, error = %error, "save failed");
                return Err(error);
            }
        };
        self.apply(data, response)
    }

    fn apply(
        &mut self,
        data: SaveChangesData,
        response: BatchResponse,
    ) -> ClientResult<SaveChangesResult> {
        if response.results.len() != data.commands.len() {
            return Err(ClientError::Protocol(format!(
                "batch of {} commands returned {} results",
                data.commands.len(),
                response.results.len()
            )));
        }

        self.compare_exchange = data.staged_compare_exchange;
        for (position, (command, result)) in
            data.commands.iter().zip(&response.results).enumerate()
        {
            let generated = position < data.session_commands;
            self.apply_result(command, result, generated);
        }

        for id in std::mem::take(&mut self.deleted).into_keys() {
            if self.has_deferred(&id, CommandMatcher::AnyCommand) {
                continue;
            }
            self.documents.shift_remove(&id);
            self.known_missing.insert(id.to_lowercase());
        }
        self.deferred.clear();

        Ok(SaveChangesResult {
            commands: data.commands,
            results: response.results,
        })
    }

    fn apply_result(&mut self, command: &CommandData, result: &BatchResultItem, generated: bool) {
        match command.command_type() {
            CommandType::Put => {
                if let Some(info) = self.documents.get_mut(command.id()) {
                    if generated {
                        info.mark_persisted(result.change_vector.clone());
                    } else if result.change_vector.is_some() {
                        info.change_vector = result.change_vector.clone();
                    }
                }
            }
            CommandType::Patch | CommandType::AttachmentPut | CommandType::AttachmentDelete => {
                if let Some(info) = self.documents.get_mut(command.id()) {
                    if result.change_vector.is_some() {
                        info.change_vector = result.change_vector.clone();
                    }
                }
            }
            CommandType::Delete => {
                self.documents.shift_remove(command.id());
                self.known_missing.insert(command.id().to_lowercase());
            }
            CommandType::CompareExchangePut => {
                if let Some(value) = self.compare_exchange.get_mut(command.id()) {
                    let index = result.index.unwrap_or(value.index());
                    value.update_state(index);
                }
            }
            CommandType::CompareExchangeDelete => {
                if let Some(value) = self.compare_exchange.get_mut(command.id()) {
                    value.update_value(CompareExchangeValue::missing(command.id()));
                }
            }
        }
    }

    fn put_change_vector(&self, info: &DocumentInfo) -> Option<String> {
        match info.concurrency_check {
            ConcurrencyCheckMode::Disabled => None,
            ConcurrencyCheckMode::Forced => Some(info.change_vector.clone().unwrap_or_default()),
            ConcurrencyCheckMode::Auto if self.conventions.use_optimistic_concurrency => {
                Some(info.change_vector.clone().unwrap_or_default())
            }
            ConcurrencyCheckMode::Auto => None,
        }
    }

    fn delete_change_vector(&self, id: &str, deleted: &DeletedEntity) -> Option<String> {
        if deleted.expected_change_vector.is_some() {
            return deleted.expected_change_vector.clone();
        }
        let info = self.documents.get(id)?;
        match info.concurrency_check {
            ConcurrencyCheckMode::Disabled => None,
            ConcurrencyCheckMode::Forced => info.change_vector.clone(),
            ConcurrencyCheckMode::Auto if self.conventions.use_optimistic_concurrency => {
                info.change_vector.clone()
            }
            ConcurrencyCheckMode::Auto => None,
        }
    }

    /// Fills in the tracked change vector of a deferred document command.
    fn with_tracked_change_vector(&self, command: CommandData) -> CommandData {
        if command.change_vector().is_some()
            || command.command_type().is_compare_exchange()
            || !self.conventions.use_optimistic_concurrency
        {
            return command;
        }
        match self.documents.get(command.id()) {
            Some(info) if info.concurrency_check != ConcurrencyCheckMode::Disabled => {
                let change_vector = info.change_vector.clone();
                command.with_change_vector(change_vector)
            }
            _ => command,
        }
    }
}
