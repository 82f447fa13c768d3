//! Enqueue validation - recipient tokens, content rules, batch bounds

use relayq_common::error::ValidationError;
use relayq_common::types::Channel;
use relayq_storage::models::{EnqueueBatch, EnqueueMessage};

/// Maximum characters in one SMS segment
pub const SMS_SEGMENT_CHARS: usize = 160;

/// Maximum segments per SMS message
pub const SMS_MAX_SEGMENTS: usize = 3;

/// Maximum characters in an SMS body
pub const SMS_MAX_CHARS: usize = SMS_SEGMENT_CHARS * SMS_MAX_SEGMENTS;

const TOKEN_PREFIX: &str = "rcpt_";
const TOKEN_SUFFIX_MIN: usize = 6;
const TOKEN_SUFFIX_MAX: usize = 64;

/// Validate an opaque recipient token.
///
/// Tokens are `rcpt_` followed by 6 to 64 characters of
/// `[A-Za-z0-9_-]`. Raw contact addresses never pass this check, which
/// is the point: the pipeline only ever handles references.
pub fn validate_recipient_token(token: &str) -> Result<(), ValidationError> {
    let Some(suffix) = token.strip_prefix(TOKEN_PREFIX) else {
        return Err(ValidationError::InvalidRecipientToken);
    };
    if suffix.len() < TOKEN_SUFFIX_MIN || suffix.len() > TOKEN_SUFFIX_MAX {
        return Err(ValidationError::InvalidRecipientToken);
    }
    if !suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidRecipientToken);
    }
    Ok(())
}

/// Validate channel-dependent content rules
pub fn validate_content(
    channel: Channel,
    subject: Option<&str>,
    body: &str,
) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::BodyRequired);
    }

    match channel {
        Channel::Email => {
            if subject.map_or(true, |s| s.trim().is_empty()) {
                return Err(ValidationError::SubjectRequired);
            }
        }
        Channel::Sms => {
            let len = body.chars().count();
            if len > SMS_MAX_CHARS {
                return Err(ValidationError::SmsBodyTooLong {
                    len,
                    max: SMS_MAX_CHARS,
                });
            }
        }
    }
    Ok(())
}

/// Validate a single-message enqueue request
pub fn validate_enqueue(input: &EnqueueMessage) -> Result<(), ValidationError> {
    validate_recipient_token(&input.recipient)?;
    validate_content(input.channel, input.subject.as_deref(), &input.body)
}

/// Validate a batch enqueue request
pub fn validate_batch(input: &EnqueueBatch, max_recipients: usize) -> Result<(), ValidationError> {
    if input.recipients.is_empty() {
        return Err(ValidationError::BatchEmpty);
    }
    if input.recipients.len() > max_recipients {
        return Err(ValidationError::BatchTooLarge {
            count: input.recipients.len(),
            max: max_recipients,
        });
    }
    for recipient in &input.recipients {
        validate_recipient_token(&recipient.recipient)?;
    }
    validate_content(input.channel, input.subject.as_deref(), &input.body)
}

/// Number of SMS segments the body occupies
pub fn sms_segments(body: &str) -> usize {
    let len = body.chars().count();
    if len == 0 {
        return 0;
    }
    len.div_ceil(SMS_SEGMENT_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayq_common::types::Priority;
    use relayq_storage::models::BatchRecipient;
    use uuid::Uuid;

    #[test]
    fn test_recipient_token_grammar() {
        assert!(validate_recipient_token("rcpt_a1b2c3").is_ok());
        assert!(validate_recipient_token("rcpt_A-b_C-9x").is_ok());
        assert!(validate_recipient_token(&format!("rcpt_{}", "x".repeat(64))).is_ok());

        // Too short, too long, bad prefix, bad characters
        assert!(validate_recipient_token("rcpt_abc").is_err());
        assert!(validate_recipient_token(&format!("rcpt_{}", "x".repeat(65))).is_err());
        assert!(validate_recipient_token("recipient_a1b2c3").is_err());
        assert!(validate_recipient_token("rcpt_user@host").is_err());
        assert!(validate_recipient_token("rcpt_has space").is_err());
        assert!(validate_recipient_token("").is_err());
    }

    #[test]
    fn test_email_requires_subject() {
        assert!(validate_content(Channel::Email, Some("Hi"), "Body").is_ok());
        assert_eq!(
            validate_content(Channel::Email, None, "Body"),
            Err(ValidationError::SubjectRequired)
        );
        assert_eq!(
            validate_content(Channel::Email, Some("   "), "Body"),
            Err(ValidationError::SubjectRequired)
        );
    }

    #[test]
    fn test_body_required() {
        assert_eq!(
            validate_content(Channel::Email, Some("Hi"), ""),
            Err(ValidationError::BodyRequired)
        );
        assert_eq!(
            validate_content(Channel::Sms, None, "  \n  "),
            Err(ValidationError::BodyRequired)
        );
    }

    #[test]
    fn test_sms_length_cap() {
        let at_cap = "x".repeat(SMS_MAX_CHARS);
        assert!(validate_content(Channel::Sms, None, &at_cap).is_ok());

        let over = "x".repeat(SMS_MAX_CHARS + 1);
        assert_eq!(
            validate_content(Channel::Sms, None, &over),
            Err(ValidationError::SmsBodyTooLong {
                len: SMS_MAX_CHARS + 1,
                max: SMS_MAX_CHARS,
            })
        );
    }

    #[test]
    fn test_sms_segments() {
        assert_eq!(sms_segments(""), 0);
        assert_eq!(sms_segments("hello"), 1);
        assert_eq!(sms_segments(&"x".repeat(160)), 1);
        assert_eq!(sms_segments(&"x".repeat(161)), 2);
        assert_eq!(sms_segments(&"x".repeat(320)), 2);
        assert_eq!(sms_segments(&"x".repeat(480)), 3);
    }

    #[test]
    fn test_batch_bounds() {
        let recipient = |n: usize| BatchRecipient {
            recipient: format!("rcpt_user{:04}", n),
            category: "guardian".to_string(),
        };
        let batch = |recipients: Vec<BatchRecipient>| EnqueueBatch {
            tenant_id: Uuid::new_v4(),
            channel: Channel::Email,
            recipients,
            subject: Some("Hi".to_string()),
            body: "Body".to_string(),
            priority: Priority::Normal,
            scheduled_at: None,
            idempotency_key: None,
        };

        assert_eq!(
            validate_batch(&batch(vec![]), 10),
            Err(ValidationError::BatchEmpty)
        );
        assert!(validate_batch(&batch((0..10).map(recipient).collect()), 10).is_ok());
        assert_eq!(
            validate_batch(&batch((0..11).map(recipient).collect()), 10),
            Err(ValidationError::BatchTooLarge { count: 11, max: 10 })
        );
    }
}
