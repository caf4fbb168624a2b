use std::collections::BTreeMap;

use chrono::Duration;
use exam_core::ErrorKind;
use exam_core::grading::{GradingPolicy, Mistake, Submission};
use exam_core::mastery::MasteryStatus;
use exam_core::model::{
    AttemptState, ExamDefinition, ExamId, ExamQuestion, ExamStatus, Question, QuestionId,
    QuestionType, UserId,
};
use exam_core::time::{fixed_clock, fixed_now};
use services::{AttemptServiceError, Clock, ExamServices, WrongQuestionServiceError};
use storage::repository::{StatusFilter, Storage, WrongQuestionFilter};

const EXAM: ExamId = ExamId::new(1);
const Q1: QuestionId = QuestionId::new(1);
const Q2: QuestionId = QuestionId::new(2);

fn bank() -> Vec<Question> {
    vec![
        Question::new(Q1, QuestionType::SingleChoice, "Pick A", "A")
            .unwrap()
            .with_options(vec!["A".into(), "B".into()])
            .with_category("basics"),
        Question::new(Q2, QuestionType::SingleChoice, "Pick C", "C")
            .unwrap()
            .with_options(vec!["B".into(), "C".into()])
            .with_explanation("C is the only safe option."),
    ]
}

fn exam(retry_limit: u32) -> ExamDefinition {
    ExamDefinition::published(
        EXAM,
        "Basics",
        30,
        60,
        vec![ExamQuestion::new(Q1, 50), ExamQuestion::new(Q2, 50)],
    )
    .unwrap()
    .with_retry_limit(retry_limit)
    .unwrap()
}

async fn seed(storage: &Storage, exam: &ExamDefinition) {
    for question in bank() {
        storage.questions.upsert_question(&question).await.unwrap();
    }
    storage.exams.upsert_exam(exam).await.unwrap();
}

async fn storage_with(retry_limit: u32) -> Storage {
    let storage = Storage::in_memory();
    seed(&storage, &exam(retry_limit)).await;
    storage
}

fn services_at(storage: &Storage, clock: Clock) -> ExamServices {
    ExamServices::from_storage(storage, clock, GradingPolicy::default())
}

fn after_deadline() -> Clock {
    fixed_clock().advanced(Duration::minutes(31))
}

fn answers(q1: &str, q2: &str) -> Submission {
    Submission::default().answer(Q1, q1).answer(Q2, q2)
}

#[tokio::test]
async fn perfect_submission_passes_without_ledger_entries() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let user = UserId::new(1);

    let attempt = services.arbiter().start_attempt(user, EXAM).await.unwrap();
    assert_eq!(attempt.state(), AttemptState::InProgress);
    assert_eq!(attempt.deadline(), fixed_now() + Duration::minutes(30));

    let result = services
        .grader()
        .submit(attempt.id(), &answers("A", "C"))
        .await
        .unwrap();
    assert_eq!(result.state, AttemptState::Pass);
    assert_eq!(result.score, 100);
    assert!(result.passed);
    assert_eq!(result.correct_count, 2);

    let ledger = services
        .wrong_questions()
        .get_wrong_questions(user, &WrongQuestionFilter::default())
        .await
        .unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn one_wrong_answer_fails_and_lands_in_the_ledger() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let user = UserId::new(2);

    let attempt = services.arbiter().start_attempt(user, EXAM).await.unwrap();
    let result = services
        .grader()
        .submit(attempt.id(), &answers("A", "B"))
        .await
        .unwrap();
    assert_eq!(result.state, AttemptState::Fail);
    assert_eq!(result.score, 50);
    assert_eq!(result.correct_count + result.wrong_count, result.total_count);

    let entries = services
        .wrong_questions()
        .get_wrong_questions(user, &WrongQuestionFilter::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].record.question_id, Q2);
    assert_eq!(entries[0].record.wrong_count, 1);
    assert_eq!(entries[0].record.last_user_answer.as_deref(), Some("B"));
    assert_eq!(entries[0].status, MasteryStatus::Practicing);
    assert_eq!(
        entries[0].question.as_ref().map(Question::content),
        Some("Pick C")
    );
}

#[tokio::test]
async fn expiry_after_deadline_times_out_with_zero_score() {
    let storage = storage_with(1).await;
    let user = UserId::new(3);
    let attempt = services_at(&storage, fixed_clock())
        .arbiter()
        .start_attempt(user, EXAM)
        .await
        .unwrap();

    let late = services_at(&storage, after_deadline());
    let result = late.grader().expire(attempt.id()).await.unwrap();
    assert_eq!(result.state, AttemptState::Timeout);
    assert_eq!(result.score, 0);
    assert!(!result.passed);

    let entries = late
        .wrong_questions()
        .get_wrong_questions(user, &WrongQuestionFilter::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.record.last_user_answer.is_none()));

    let err = late
        .grader()
        .submit(attempt.id(), &answers("A", "C"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttemptServiceError::AttemptNotInProgress {
            state: AttemptState::Timeout,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn expiry_before_deadline_is_refused() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let attempt = services
        .arbiter()
        .start_attempt(UserId::new(4), EXAM)
        .await
        .unwrap();

    let err = services.grader().expire(attempt.id()).await.unwrap_err();
    assert!(matches!(err, AttemptServiceError::DeadlineNotReached { .. }));
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);

    let still_running = services.grader().get_attempt(attempt.id()).await.unwrap();
    assert!(still_running.is_in_progress());
}

#[tokio::test]
async fn concurrent_starts_yield_a_single_attempt() {
    let storage = storage_with(3).await;
    let services = services_at(&storage, fixed_clock());
    let arbiter = services.arbiter();
    let user = UserId::new(5);

    let (first, second) = tokio::join!(
        arbiter.start_attempt(user, EXAM),
        arbiter.start_attempt(user, EXAM)
    );
    let (winner, loser) = match (first, second) {
        (Ok(attempt), Err(err)) | (Err(err), Ok(attempt)) => (attempt, err),
        other => panic!("expected exactly one start to succeed: {other:?}"),
    };

    match loser {
        AttemptServiceError::AttemptAlreadyInProgress {
            attempt_id,
            deadline,
        } => {
            assert_eq!(attempt_id, winner.id());
            assert_eq!(deadline, winner.deadline());
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let history = services.grader().list_attempts(user, EXAM).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn submit_and_expire_race_has_one_winner() {
    let storage = storage_with(1).await;
    let user = UserId::new(6);
    let attempt = services_at(&storage, fixed_clock())
        .arbiter()
        .start_attempt(user, EXAM)
        .await
        .unwrap();

    let late = services_at(&storage, after_deadline());
    let grader = late.grader();
    let submission = answers("B", "B");
    let (submitted, expired) = tokio::join!(
        grader.submit(attempt.id(), &submission),
        grader.expire(attempt.id())
    );

    let outcomes = [submitted, expired];
    let won = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(won, 1);
    assert!(outcomes.iter().any(|o| matches!(
        o,
        Err(AttemptServiceError::AttemptNotInProgress { .. })
    )));

    let stored = grader.get_attempt(attempt.id()).await.unwrap();
    assert_eq!(stored.state(), AttemptState::Timeout);

    let entry = late
        .wrong_questions()
        .get_wrong_question(user, Q1)
        .await
        .unwrap();
    assert_eq!(entry.record.wrong_count, 1);
}

#[tokio::test]
async fn retry_limit_blocks_further_attempts() {
    let storage = storage_with(2).await;
    let services = services_at(&storage, fixed_clock());
    let user = UserId::new(7);

    for _ in 0..2 {
        let attempt = services.arbiter().start_attempt(user, EXAM).await.unwrap();
        services
            .grader()
            .submit(attempt.id(), &answers("B", "B"))
            .await
            .unwrap();
    }

    let err = services
        .arbiter()
        .start_attempt(user, EXAM)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttemptServiceError::RetryLimitExceeded { limit: 2, used: 2 }
    ));
    assert_eq!(err.kind(), ErrorKind::PolicyViolation);

    let numbers: Vec<u32> = services
        .grader()
        .list_attempts(user, EXAM)
        .await
        .unwrap()
        .iter()
        .map(|a| a.attempt_number())
        .collect();
    assert_eq!(numbers, vec![1, 2]);
}

#[tokio::test]
async fn closed_or_missing_exams_refuse_new_attempts() {
    let storage = Storage::in_memory();
    let closed = exam(1)
        .with_window(None, Some(fixed_now() - Duration::days(1)))
        .unwrap();
    seed(&storage, &closed).await;
    let draft = ExamDefinition::published(
        ExamId::new(2),
        "Unreleased",
        10,
        1,
        vec![ExamQuestion::new(Q1, 1)],
    )
    .unwrap()
    .with_status(ExamStatus::Draft);
    storage.exams.upsert_exam(&draft).await.unwrap();

    let arbiter = services_at(&storage, fixed_clock()).arbiter();
    let user = UserId::new(8);

    let err = arbiter.start_attempt(user, EXAM).await.unwrap_err();
    assert!(matches!(err, AttemptServiceError::ExamNotActive(id) if id == EXAM));

    let err = arbiter.start_attempt(user, ExamId::new(2)).await.unwrap_err();
    assert!(matches!(err, AttemptServiceError::ExamNotActive(_)));

    let err = arbiter.start_attempt(user, ExamId::new(99)).await.unwrap_err();
    assert!(matches!(err, AttemptServiceError::ExamNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn drafts_are_graded_when_the_attempt_expires() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let attempt = services
        .arbiter()
        .start_attempt(UserId::new(9), EXAM)
        .await
        .unwrap();

    services
        .grader()
        .save_draft(attempt.id(), &answers("A", "C"))
        .await
        .unwrap();
    let err = services
        .grader()
        .save_draft(attempt.id(), &Submission::default().answer(QuestionId::new(42), "A"))
        .await
        .unwrap_err();
    assert!(matches!(err, AttemptServiceError::UnknownQuestion(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let late = services_at(&storage, after_deadline());
    let result = late.grader().expire(attempt.id()).await.unwrap();
    assert_eq!(result.state, AttemptState::Timeout);
    assert_eq!(result.score, 100);

    let err = late
        .grader()
        .save_draft(attempt.id(), &answers("A", "C"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn cheating_overrides_a_perfect_score() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let attempt = services
        .arbiter()
        .start_attempt(UserId::new(10), EXAM)
        .await
        .unwrap();

    let result = services
        .grader()
        .submit(attempt.id(), &answers("A", "C").with_cheat_signals(4))
        .await
        .unwrap();
    assert_eq!(result.state, AttemptState::Cheating);
    assert_eq!(result.score, 100);
    assert!(result.flagged_cheating);
    assert!(!result.passed);
}

#[tokio::test]
async fn repeated_misses_need_intensive_practice_until_mastered() {
    let storage = storage_with(3).await;
    let services = services_at(&storage, fixed_clock());
    let ledger = services.wrong_questions();
    let user = UserId::new(11);

    for _ in 0..3 {
        let attempt = services.arbiter().start_attempt(user, EXAM).await.unwrap();
        services
            .grader()
            .submit(attempt.id(), &answers("A", "B"))
            .await
            .unwrap();
    }
    assert_eq!(
        ledger.mastery_status(user, Q2).await.unwrap(),
        MasteryStatus::NeedsIntensivePractice
    );

    for answer in ["C", "B", "C", "B", "B"] {
        let mut practice = BTreeMap::new();
        practice.insert(Q2, answer.to_owned());
        let report = ledger.submit_practice(user, &practice).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.outcomes[0].correct_answer, "C");
        assert_eq!(
            report.outcomes[0].explanation.as_deref(),
            Some("C is the only safe option.")
        );
    }

    let entry = ledger.get_wrong_question(user, Q2).await.unwrap();
    assert_eq!(entry.record.wrong_count, 3);
    assert_eq!(entry.record.practice_count, 5);
    assert_eq!(entry.record.correct_count, 2);
    assert_eq!(entry.status, MasteryStatus::NeedsIntensivePractice);

    let intensive = ledger
        .get_wrong_questions(
            user,
            &WrongQuestionFilter::default().with_status(StatusFilter::Intensive),
        )
        .await
        .unwrap();
    assert_eq!(intensive.len(), 1);

    let mastered = ledger.mark_mastered(user, Q2).await.unwrap();
    assert!(mastered.mastered);
    assert_eq!(
        ledger.mastery_status(user, Q2).await.unwrap(),
        MasteryStatus::Mastered
    );

    let stats = ledger.statistics(user).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.mastered, 1);
    assert_eq!(stats.needs_intensive_practice, 0);

    assert_eq!(ledger.clear_mastered(user).await.unwrap(), 1);
    let err = ledger.mastery_status(user, Q2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn practice_generation_skips_mastered_entries_and_hides_answers() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let ledger = services.wrong_questions();
    let user = UserId::new(12);
    let exam_id = EXAM;

    ledger
        .record_mistakes(
            user,
            exam_id,
            &[
                Mistake {
                    question_id: Q1,
                    user_answer: Some("B".into()),
                },
                Mistake {
                    question_id: Q2,
                    user_answer: None,
                },
            ],
        )
        .await
        .unwrap();
    ledger.mark_mastered(user, Q1).await.unwrap();

    let seeded = (*ledger).clone().with_shuffle_seed(7);
    let items = seeded
        .generate_practice(user, &WrongQuestionFilter::default(), 10)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].question_id, Q2);
    assert_eq!(items[0].options, vec!["B".to_owned(), "C".to_owned()]);

    let none = seeded
        .generate_practice(user, &WrongQuestionFilter::default(), 0)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn notes_and_practice_require_an_existing_entry() {
    let storage = storage_with(1).await;
    let ledger = services_at(&storage, fixed_clock()).wrong_questions();
    let user = UserId::new(13);

    let err = ledger.record_practice(user, Q1, true).await.unwrap_err();
    assert!(matches!(
        err,
        WrongQuestionServiceError::EntryNotFound { question_id, .. } if question_id == Q1
    ));

    ledger
        .record_mistakes(
            user,
            EXAM,
            &[Mistake {
                question_id: Q1,
                user_answer: None,
            }],
        )
        .await
        .unwrap();
    let noted = ledger
        .add_note(user, Q1, Some("  read twice  "))
        .await
        .unwrap();
    assert_eq!(noted.user_note.as_deref(), Some("read twice"));
    let cleared = ledger.add_note(user, Q1, Some("   ")).await.unwrap();
    assert_eq!(cleared.user_note, None);
}

#[tokio::test]
async fn sweep_expires_overdue_attempts_once() {
    let storage = storage_with(1).await;
    let early = services_at(&storage, fixed_clock());
    for user in [21, 22] {
        early
            .arbiter()
            .start_attempt(UserId::new(user), EXAM)
            .await
            .unwrap();
    }

    let nothing_due = early.sweep().run_once(10).await.unwrap();
    assert_eq!(nothing_due.scanned, 0);

    let late = services_at(&storage, after_deadline());
    let report = late.sweep().run_once(10).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.expired, 2);
    assert_eq!(report.failed, 0);

    let again = late.sweep().run_once(10).await.unwrap();
    assert_eq!(again.scanned, 0);

    let history = late
        .grader()
        .list_attempts(UserId::new(21), EXAM)
        .await
        .unwrap();
    assert_eq!(history[0].state(), AttemptState::Timeout);
}

#[tokio::test]
async fn sweep_leaves_attempts_alone_during_the_grace_period() {
    let storage = storage_with(1).await;
    let policy = GradingPolicy::new(3, 60);
    let at = |offset: Duration| {
        ExamServices::from_storage(&storage, fixed_clock().advanced(offset), policy)
    };
    let user = UserId::new(23);
    let attempt = at(Duration::zero())
        .arbiter()
        .start_attempt(user, EXAM)
        .await
        .unwrap();
    let deadline = Duration::minutes(30);

    let in_grace = at(deadline + Duration::seconds(1));
    let report = in_grace.sweep().run_once(10).await.unwrap();
    assert_eq!(report.scanned, 0);
    let err = in_grace.grader().expire(attempt.id()).await.unwrap_err();
    assert!(matches!(err, AttemptServiceError::DeadlineNotReached { .. }));

    let result = at(deadline + Duration::seconds(30))
        .grader()
        .submit(attempt.id(), &answers("A", "C"))
        .await
        .unwrap();
    assert_eq!(result.state, AttemptState::Pass);
    assert_eq!(result.score, 100);

    let straggler = at(Duration::zero())
        .arbiter()
        .start_attempt(UserId::new(24), EXAM)
        .await
        .unwrap();
    let report = at(deadline + Duration::seconds(61))
        .sweep()
        .run_once(10)
        .await
        .unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.expired, 1);
    let closed = in_grace.grader().get_attempt(straggler.id()).await.unwrap();
    assert_eq!(closed.state(), AttemptState::Timeout);
}

#[tokio::test]
async fn bank_edits_after_start_do_not_change_grading() {
    let storage = storage_with(1).await;
    let services = services_at(&storage, fixed_clock());
    let user = UserId::new(25);
    let attempt = services.arbiter().start_attempt(user, EXAM).await.unwrap();

    let edited = Question::new(Q1, QuestionType::SingleChoice, "Pick A", "B").unwrap();
    storage.questions.upsert_question(&edited).await.unwrap();
    let reweighted = ExamDefinition::published(
        EXAM,
        "Basics",
        30,
        60,
        vec![ExamQuestion::new(Q1, 90), ExamQuestion::new(Q2, 10)],
    )
    .unwrap();
    storage.exams.upsert_exam(&reweighted).await.unwrap();

    let result = services
        .grader()
        .submit(attempt.id(), &answers("A", "B"))
        .await
        .unwrap();
    assert_eq!(result.state, AttemptState::Fail);
    assert_eq!(result.score, 50);

    let stored = services.grader().get_attempt(attempt.id()).await.unwrap();
    assert!(stored.answers()[0].is_correct);
    assert_eq!(stored.answers()[0].awarded_score, 50);
    assert!(!stored.answers()[1].is_correct);
}

#[tokio::test]
async fn sqlite_backed_services_run_the_full_flow() {
    let storage = Storage::sqlite("sqlite:file:memdb_services_flow?mode=memory&cache=shared")
        .await
        .unwrap();
    seed(&storage, &exam(2)).await;
    let services = services_at(&storage, fixed_clock());
    let user = UserId::new(30);

    let attempt = services.arbiter().start_attempt(user, EXAM).await.unwrap();
    let err = services
        .arbiter()
        .start_attempt(user, EXAM)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttemptServiceError::AttemptAlreadyInProgress { attempt_id, .. } if attempt_id == attempt.id()
    ));

    let result = services
        .grader()
        .submit(attempt.id(), &answers("A", "B"))
        .await
        .unwrap();
    assert_eq!(result.state, AttemptState::Fail);
    assert_eq!(
        services.grader().get_result(attempt.id()).await.unwrap(),
        Some(result)
    );

    let entry = services
        .wrong_questions()
        .get_wrong_question(user, Q2)
        .await
        .unwrap();
    assert_eq!(entry.record.wrong_count, 1);
    assert_eq!(entry.record.origin_exam_id, EXAM);
}
