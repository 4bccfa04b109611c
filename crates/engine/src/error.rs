use snafu::Snafu;

use crate::ids::ConversationId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("conversation '{id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        id: ConversationId,
    },
    #[snafu(display("conversation '{id}' cannot be deleted while {reason}"))]
    DeleteRejected {
        stage: &'static str,
        id: ConversationId,
        reason: &'static str,
    },
    #[snafu(display("engine id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
