//! Resumption policy for interrupted downloads

use resumedl_types::{InterruptReason, ResumeMode};
use url::Url;

/// Facts about an interrupted download that decide how it may continue
#[derive(Debug, Clone)]
pub struct ResumeContext<'a> {
    pub url: Option<&'a Url>,
    /// Whether a partial file is still on disk
    pub has_current_path: bool,
    /// Whether an etag or last-modified value is known
    pub has_validators: bool,
    pub auto_resume_count: u32,
    pub max_auto_resume_attempts: u32,
    pub paused: bool,
    pub reason: Option<InterruptReason>,
}

/// Classify how an interrupted download may be resumed.
pub fn resume_mode(context: &ResumeContext<'_>) -> ResumeMode {
    use InterruptReason::*;

    let resumable_scheme = context
        .url
        .is_some_and(|url| matches!(url.scheme(), "http" | "https"));
    if !resumable_scheme {
        return ResumeMode::Invalid;
    }

    let mut restart_required = !context.has_current_path || !context.has_validators;
    let mut user_action_required =
        context.auto_resume_count >= context.max_auto_resume_attempts || context.paused;

    match context.reason {
        Some(FileTransientError | NetworkTimeout) => {}

        Some(ServerNoRange | FileHashMismatch | FileTooShort) => restart_required = true,

        Some(FileNoSpace) => user_action_required = true,

        Some(FileFailed | FileAccessDenied | FileNameTooLong | FileTooLarge) => {
            user_action_required = true;
            restart_required = true;
        }

        Some(
            NetworkFailed | NetworkDisconnected | NetworkServerDown | ServerFailed | ServerUnreachable
            | UserShutdown | Crash,
        ) => user_action_required = true,

        None
        | Some(
            NetworkInvalidRequest | FileVirusInfected | ServerBadContent | UserCanceled | FileBlocked
            | FileSecurityCheckFailed | ServerUnauthorized | ServerCertProblem | ServerForbidden,
        ) => return ResumeMode::Invalid,
    }

    match (user_action_required, restart_required) {
        (true, true) => ResumeMode::UserRestart,
        (false, true) => ResumeMode::ImmediateRestart,
        (true, false) => ResumeMode::UserContinue,
        (false, false) => ResumeMode::ImmediateContinue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(url: &Url, reason: InterruptReason) -> ResumeContext<'_> {
        ResumeContext {
            url: Some(url),
            has_current_path: true,
            has_validators: true,
            auto_resume_count: 0,
            max_auto_resume_attempts: 5,
            paused: false,
            reason: Some(reason),
        }
    }

    fn http() -> Url {
        Url::parse("https://example.com/file.iso").unwrap()
    }

    #[test]
    fn test_hash_mismatch_always_restarts() {
        let url = http();
        let mut ctx = context(&url, InterruptReason::FileHashMismatch);
        assert_eq!(resume_mode(&ctx), ResumeMode::ImmediateRestart);
        ctx.auto_resume_count = 5;
        assert_eq!(resume_mode(&ctx), ResumeMode::UserRestart);
        ctx.has_current_path = false;
        assert!(resume_mode(&ctx).is_restart());
    }

    #[test]
    fn test_no_space_always_needs_user() {
        let url = http();
        let mut ctx = context(&url, InterruptReason::FileNoSpace);
        assert_eq!(resume_mode(&ctx), ResumeMode::UserContinue);
        ctx.has_validators = false;
        assert_eq!(resume_mode(&ctx), ResumeMode::UserRestart);
    }

    #[test]
    fn test_auto_resume_budget_exhausted() {
        let url = http();
        for reason in [InterruptReason::FileTransientError, InterruptReason::NetworkTimeout] {
            let mut ctx = context(&url, reason);
            assert_eq!(resume_mode(&ctx), ResumeMode::ImmediateContinue);
            ctx.auto_resume_count = 4;
            assert!(resume_mode(&ctx).is_immediate());
            ctx.auto_resume_count = 5;
            assert_eq!(resume_mode(&ctx), ResumeMode::UserContinue);
        }
    }

    #[test]
    fn test_paused_download_needs_user() {
        let url = http();
        let mut ctx = context(&url, InterruptReason::NetworkTimeout);
        ctx.paused = true;
        assert_eq!(resume_mode(&ctx), ResumeMode::UserContinue);
    }

    #[test]
    fn test_missing_validators_force_restart() {
        let url = http();
        let mut ctx = context(&url, InterruptReason::FileTransientError);
        ctx.has_validators = false;
        assert_eq!(resume_mode(&ctx), ResumeMode::ImmediateRestart);
    }

    #[test]
    fn test_invalid_cases() {
        let url = http();
        for reason in [
            InterruptReason::UserCanceled,
            InterruptReason::ServerForbidden,
            InterruptReason::FileVirusInfected,
            InterruptReason::ServerBadContent,
        ] {
            assert_eq!(resume_mode(&context(&url, reason)), ResumeMode::Invalid);
        }

        let mut ctx = context(&url, InterruptReason::NetworkFailed);
        ctx.reason = None;
        assert_eq!(resume_mode(&ctx), ResumeMode::Invalid);

        let ftp = Url::parse("ftp://example.com/file").unwrap();
        assert_eq!(
            resume_mode(&context(&ftp, InterruptReason::NetworkFailed)),
            ResumeMode::Invalid
        );
    }

    #[test]
    fn test_file_errors_need_user_and_restart() {
        let url = http();
        for reason in [
            InterruptReason::FileFailed,
            InterruptReason::FileAccessDenied,
            InterruptReason::FileNameTooLong,
            InterruptReason::FileTooLarge,
        ] {
            assert_eq!(resume_mode(&context(&url, reason)), ResumeMode::UserRestart);
        }
        assert_eq!(
            resume_mode(&context(&url, InterruptReason::UserShutdown)),
            ResumeMode::UserContinue
        );
    }
}
