mod attempt;
mod exam;
mod ids;
mod question;

pub use ids::{AttemptId, ExamId, ParseIdError, QuestionId, UserId, WrongQuestionId};

pub use attempt::{
    AnswerRecord, AttemptError, AttemptState, ExamAttempt, ExamResult, NewAttempt,
    PersistedAttempt, QuestionSnapshot,
};
pub use exam::{ExamDefinition, ExamError, ExamQuestion, ExamStatus};
pub use question::{Question, QuestionError, QuestionStatus, QuestionType};
