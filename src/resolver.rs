//! One resolution pass per call. The strategy was fixed when the context
//! was built; a pass never mixes strategies.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::OtpError;
use crate::llm::OtpParser;
use crate::store::OtpStore;
use crate::types::{OtpPollContext, OtpSource, OtpValue};
use crate::webhook::WebhookClient;

/// Webhook responses longer than this are treated as page excerpts and
/// handed to the LLM parser instead of being used verbatim.
const MAX_BARE_CODE_LEN: usize = 10;

pub struct OtpSourceResolver {
    store: Arc<OtpStore>,
    webhook: WebhookClient,
    parser: Option<Arc<dyn OtpParser>>,
}

impl OtpSourceResolver {
    pub fn new(
        store: Arc<OtpStore>,
        webhook: WebhookClient,
        parser: Option<Arc<dyn OtpParser>>,
    ) -> Self {
        Self {
            store,
            webhook,
            parser,
        }
    }

    /// Attempt exactly one pass. `Ok(None)` means "no code yet, keep
    /// polling"; only webhook transport exhaustion and store failures
    /// surface as errors.
    pub async fn resolve(
        &self,
        ctx: &OtpPollContext,
        api_token: Option<&str>,
    ) -> Result<Option<OtpValue>, OtpError> {
        match ctx.source() {
            OtpSource::Webhook { url } => self.resolve_from_webhook(ctx, url, api_token).await,
            OtpSource::Identifier { identifier } => {
                self.resolve_from_identifier(ctx, identifier).await
            }
            OtpSource::RunLookup => self.resolve_from_run(ctx).await,
        }
    }

    async fn resolve_from_webhook(
        &self,
        ctx: &OtpPollContext,
        url: &str,
        api_token: Option<&str>,
    ) -> Result<Option<OtpValue>, OtpError> {
        let Some(api_token) = api_token else {
            // The poller refuses to start without a token; reaching this
            // point without one is a wiring bug, not a poll failure.
            warn!("webhook resolution invoked without an organization API token");
            return Ok(None);
        };

        let payload = json!({
            "task_id": ctx.task_id,
            "workflow_run_id": ctx.workflow_run_id,
            "workflow_permanent_id": ctx.workflow_permanent_id,
        });
        let response = self.webhook.post_signed(url, api_token, &payload).await?;

        let code = response
            .get("verification_code")
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|code| !code.is_empty());

        match code {
            None => Ok(None),
            Some(raw) if raw.len() > MAX_BARE_CODE_LEN => self.reparse_long_content(ctx, raw).await,
            Some(raw) => Ok(Some(OtpValue::infer(raw))),
        }
    }

    /// Long content is probably an email body or page excerpt; ask the
    /// LLM to dig the value out. Any parse problem is "no code yet".
    async fn reparse_long_content(
        &self,
        ctx: &OtpPollContext,
        raw: &str,
    ) -> Result<Option<OtpValue>, OtpError> {
        let Some(parser) = &self.parser else {
            warn!("webhook returned {} chars and no LLM parser is configured", raw.len());
            return Ok(None);
        };

        match parser
            .parse_otp_login(raw, &ctx.organization_id, None)
            .await
        {
            Ok(parsed) if parsed.otp_value_found => {
                let Some(value) = parsed.otp_value.filter(|v| !v.is_empty()) else {
                    return Ok(None);
                };
                Ok(Some(match parsed.otp_type {
                    Some(otp_type) => OtpValue { value, otp_type },
                    None => OtpValue::infer(value),
                }))
            }
            Ok(_) => {
                debug!("LLM found no verification value in webhook content");
                Ok(None)
            }
            Err(err) => {
                warn!("LLM parse of webhook content failed: {err:#}");
                Ok(None)
            }
        }
    }

    async fn resolve_from_identifier(
        &self,
        ctx: &OtpPollContext,
        identifier: &str,
    ) -> Result<Option<OtpValue>, OtpError> {
        let codes = self
            .store
            .get_otp_codes(&ctx.organization_id, identifier)
            .await?;
        if let Some(code) = codes.iter().find(|code| code.matches_run(ctx)) {
            return Ok(Some(OtpValue::infer(code.code.clone())));
        }
        // Nothing under the identifier yet; the code may have been pushed
        // against the run directly.
        self.resolve_from_run(ctx).await
    }

    async fn resolve_from_run(&self, ctx: &OtpPollContext) -> Result<Option<OtpValue>, OtpError> {
        if ctx.task_id.is_none() && ctx.workflow_run_id.is_none() {
            return Ok(None);
        }
        let codes = self
            .store
            .get_otp_codes_by_run(
                &ctx.organization_id,
                ctx.task_id.as_deref(),
                ctx.workflow_run_id.as_deref(),
                1,
            )
            .await?;
        Ok(codes
            .into_iter()
            .next()
            .map(|code| OtpValue::infer(code.code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OtpConfig;
    use crate::llm::ParsedOtp;
    use crate::store::test_store;
    use crate::types::{NewOtpCode, OtpType};
    use anyhow::Result;
    use async_trait::async_trait;

    struct StaticParser(ParsedOtp);

    #[async_trait]
    impl OtpParser for StaticParser {
        async fn parse_otp_login(
            &self,
            _content: &str,
            _organization_id: &str,
            _enforced_type: Option<OtpType>,
        ) -> Result<ParsedOtp> {
            Ok(self.0.clone())
        }
    }

    async fn resolver_with(parser: Option<Arc<dyn OtpParser>>) -> (Arc<OtpStore>, OtpSourceResolver) {
        let store = Arc::new(test_store().await);
        let resolver = OtpSourceResolver::new(
            Arc::clone(&store),
            WebhookClient::new(&OtpConfig::default()),
            parser,
        );
        (store, resolver)
    }

    #[tokio::test]
    async fn run_lookup_finds_task_scoped_code() {
        let (store, resolver) = resolver_with(None).await;
        store
            .add_otp_code(NewOtpCode {
                organization_id: "org_1".into(),
                task_id: Some("tsk_1".into()),
                code: "123456".into(),
                ..NewOtpCode::default()
            })
            .await
            .unwrap();

        let ctx = OtpPollContext::for_task("org_1", "tsk_1");
        let found = resolver.resolve(&ctx, None).await.unwrap().unwrap();
        assert_eq!(found.value, "123456");
    }

    #[tokio::test]
    async fn run_lookup_without_any_run_id_is_empty() {
        let (_store, resolver) = resolver_with(None).await;
        let ctx = OtpPollContext::new("org_1", None, None, None, None, None, None);
        assert!(resolver.resolve(&ctx, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identifier_path_respects_run_dimensions() {
        let (store, resolver) = resolver_with(None).await;
        // Same identifier, pinned to a different workflow run: must not match.
        store
            .add_otp_code(NewOtpCode {
                organization_id: "org_1".into(),
                workflow_run_id: Some("wfr_other".into()),
                totp_identifier: Some("user@example.com".into()),
                code: "999999".into(),
                ..NewOtpCode::default()
            })
            .await
            .unwrap();
        store
            .add_otp_code(NewOtpCode {
                organization_id: "org_1".into(),
                workflow_run_id: Some("wfr_1".into()),
                totp_identifier: Some("user@example.com".into()),
                code: "111222".into(),
                ..NewOtpCode::default()
            })
            .await
            .unwrap();

        let ctx = OtpPollContext::new(
            "org_1",
            None,
            Some("wf_1".into()),
            Some("wfr_1".into()),
            Some("wpid_1".into()),
            None,
            Some("user@example.com".into()),
        );
        let found = resolver.resolve(&ctx, None).await.unwrap().unwrap();
        assert_eq!(found.value, "111222");
    }

    #[tokio::test]
    async fn identifier_path_falls_back_to_run_lookup() {
        let (store, resolver) = resolver_with(None).await;
        store
            .add_otp_code(NewOtpCode {
                organization_id: "org_1".into(),
                task_id: Some("tsk_1".into()),
                code: "654321".into(),
                ..NewOtpCode::default()
            })
            .await
            .unwrap();

        let ctx = OtpPollContext::new(
            "org_1",
            Some("tsk_1".into()),
            None,
            None,
            None,
            None,
            Some("identifier-with-no-codes".into()),
        );
        let found = resolver.resolve(&ctx, None).await.unwrap().unwrap();
        assert_eq!(found.value, "654321");
    }

    #[tokio::test]
    async fn magic_link_codes_keep_their_type() {
        let (store, resolver) = resolver_with(None).await;
        store
            .add_otp_code(NewOtpCode {
                organization_id: "org_1".into(),
                task_id: Some("tsk_1".into()),
                code: "https://login.example.com/magic?t=abc".into(),
                ..NewOtpCode::default()
            })
            .await
            .unwrap();

        let ctx = OtpPollContext::for_task("org_1", "tsk_1");
        let found = resolver.resolve(&ctx, None).await.unwrap().unwrap();
        assert_eq!(found.otp_type, OtpType::MagicLink);
    }

    #[tokio::test]
    async fn long_content_goes_through_the_parser() {
        let parser = StaticParser(ParsedOtp {
            otp_value_found: true,
            otp_value: Some("778899".into()),
            otp_type: Some(OtpType::Totp),
        });
        let (_store, resolver) = resolver_with(Some(Arc::new(parser))).await;

        let ctx = OtpPollContext::for_task("org_1", "tsk_1");
        let found = resolver
            .reparse_long_content(&ctx, "Use code 778899 to finish logging in to Example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.value, "778899");
        assert_eq!(found.otp_type, OtpType::Totp);
    }

    #[tokio::test]
    async fn parser_miss_or_absence_means_no_code_this_pass() {
        let parser = StaticParser(ParsedOtp::default());
        let (_store, resolver) = resolver_with(Some(Arc::new(parser))).await;
        let ctx = OtpPollContext::for_task("org_1", "tsk_1");
        assert!(resolver
            .reparse_long_content(&ctx, "nothing useful in here")
            .await
            .unwrap()
            .is_none());

        let (_store, resolver) = resolver_with(None).await;
        assert!(resolver
            .reparse_long_content(&ctx, "long content, nobody to parse it")
            .await
            .unwrap()
            .is_none());
    }
}
