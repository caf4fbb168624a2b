#![forbid(unsafe_code)]

pub mod app_services;
pub mod attempts;
pub mod error;
pub mod wrong_question_service;

pub use exam_core::Clock;

pub use app_services::ExamServices;
pub use attempts::{AttemptArbiter, ExpirySweep, SessionGrader, SweepReport};
pub use error::{AttemptServiceError, ExamServicesError, WrongQuestionServiceError};
pub use wrong_question_service::{
    PracticeItem, PracticeOutcome, PracticeReport, WrongQuestionEntry, WrongQuestionService,
};
