//! Remote accounts appearing as local virtual users.

use crate::bridge::BridgeContext;
use crate::error::{BridgeError, Result};
use crate::http::HttpRequest;
use crate::image::sniff_mime;
use crate::store::traits::PuppetRecord;
use log::{debug, info, warn};
use tokio::sync::RwLock;
use wxcore::{Contact, UserDetail, WechatId};

/// Builds virtual user ids from remote ids and back.
///
/// The localpart template must contain `{userid}`; the remote id is escaped
/// so that the result is a valid, lowercase localpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxidTemplate {
    prefix: String,
    suffix: String,
    domain: String,
}

impl MxidTemplate {
    pub fn new(localpart_template: &str, domain: &str) -> Self {
        let (prefix, suffix) = localpart_template
            .split_once("{userid}")
            .unwrap_or((localpart_template, ""));
        Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            domain: domain.to_string(),
        }
    }

    pub fn format(&self, wxid: &WechatId) -> String {
        format!(
            "@{}{}{}:{}",
            self.prefix,
            escape_localpart(wxid.as_str()),
            self.suffix,
            self.domain
        )
    }

    /// Recovers the remote id from a virtual user id. `None` for ids outside
    /// the bridge's namespace.
    pub fn parse(&self, mxid: &str) -> Option<WechatId> {
        let (localpart, server) = mxid.strip_prefix('@')?.split_once(':')?;
        if server != self.domain {
            return None;
        }
        let escaped = localpart
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if escaped.is_empty() {
            return None;
        }
        unescape_localpart(escaped).map(WechatId::from)
    }
}

/// `_` becomes `__`, uppercase letters become `_` plus the lowercase
/// letter, and anything outside `[a-z0-9.-/]` becomes `=xx` per UTF-8 byte.
pub fn escape_localpart(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '/' => out.push(c),
            '_' => out.push_str("__"),
            'A'..='Z' => {
                out.push('_');
                out.push(c.to_ascii_lowercase());
            }
            _ => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("={b:02x}"));
                }
            }
        }
    }
    out
}

pub fn unescape_localpart(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let next = *bytes.get(i + 1)?;
                match next {
                    b'_' => out.push(b'_'),
                    b'a'..=b'z' => out.push(next.to_ascii_uppercase()),
                    _ => return None,
                }
                i += 2;
            }
            b'=' => {
                let hex = escaped.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Name shown for a contact: the owner's remark wins over the account name.
pub fn contact_display_name(contact: &Contact) -> &str {
    if !contact.remarks.is_empty() {
        &contact.remarks
    } else if !contact.name.is_empty() {
        &contact.name
    } else {
        contact.wxid.as_str()
    }
}

pub struct Puppet {
    wxid: WechatId,
    mxid: String,
    record: RwLock<PuppetRecord>,
}

impl Puppet {
    pub fn new(record: PuppetRecord, template: &MxidTemplate) -> Self {
        Self {
            wxid: record.wxid.clone(),
            mxid: template.format(&record.wxid),
            record: RwLock::new(record),
        }
    }

    pub fn wxid(&self) -> &WechatId {
        &self.wxid
    }

    /// The virtual user this account appears as.
    pub fn mxid(&self) -> &str {
        &self.mxid
    }

    pub async fn record(&self) -> PuppetRecord {
        self.record.read().await.clone()
    }

    pub async fn custom_mxid(&self) -> Option<String> {
        self.record.read().await.custom_mxid.clone()
    }

    pub async fn display_name(&self) -> String {
        let record = self.record.read().await;
        if !record.remarks.is_empty() {
            record.remarks.clone()
        } else if !record.name.is_empty() {
            record.name.clone()
        } else {
            self.wxid.to_string()
        }
    }

    /// Applies a refreshed contact entry, pushing only what changed to the
    /// local side. Returns whether anything changed. `detail` supplies a
    /// higher resolution avatar when the box has one.
    pub async fn update_info(
        &self,
        ctx: &BridgeContext,
        contact: &Contact,
        detail: Option<&UserDetail>,
    ) -> Result<bool> {
        let mut record = self.record.write().await;
        let mut changed = false;

        if record.remarks != contact.remarks || record.wxcode != contact.wxcode {
            record.remarks = contact.remarks.clone();
            record.wxcode = contact.wxcode.clone();
            changed = true;
        }

        let wanted_name = contact_display_name(contact).to_string();
        if record.name != contact.name || !record.name_set || changed {
            record.name = contact.name.clone();
            let displayname = ctx.config.bridge.format_displayname(&wanted_name);
            record.name_set = match self.push_display_name(ctx, &displayname).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "Bridge/Puppet", "Failed to set display name of {}: {e}", self.wxid);
                    false
                }
            };
            changed = true;
        }

        if record.headimg != contact.headimg || !record.avatar_set {
            record.headimg = contact.headimg.clone();
            let download = detail
                .map(|d| d.big_headimg.as_str())
                .filter(|url| !url.is_empty() && !contact.headimg.is_empty())
                .unwrap_or(contact.headimg.as_str());
            match self.push_avatar(ctx, download).await {
                Ok(url) => {
                    record.avatar_url = url;
                    record.avatar_set = true;
                }
                Err(e) => {
                    warn!(target: "Bridge/Puppet", "Failed to update avatar of {}: {e}", self.wxid);
                    record.avatar_set = false;
                }
            }
            changed = true;
        }

        if changed {
            debug!(target: "Bridge/Puppet", "Info of {} changed, saving", self.wxid);
            ctx.store.save_puppet(&record).await?;
        }
        Ok(changed)
    }

    async fn push_display_name(&self, ctx: &BridgeContext, name: &str) -> Result<()> {
        ctx.local.ensure_registered(&self.mxid).await?;
        ctx.local.set_display_name(&self.mxid, name).await?;
        Ok(())
    }

    /// Downloads the avatar and uploads it to the local side. An empty URL
    /// clears the avatar.
    async fn push_avatar(&self, ctx: &BridgeContext, url: &str) -> Result<Option<String>> {
        ctx.local.ensure_registered(&self.mxid).await?;
        if url.is_empty() {
            ctx.local.set_avatar_url(&self.mxid, "").await?;
            return Ok(None);
        }
        let response = ctx
            .client
            .http_client
            .execute(HttpRequest::get(url))
            .await
            .map_err(|e| BridgeError::Media(format!("avatar download failed: {e}")))?;
        if !response.is_success() || response.body.is_empty() {
            return Err(BridgeError::Media(format!(
                "avatar download answered with status {}",
                response.status_code
            )));
        }
        let mime = sniff_mime(&response.body);
        let content_uri = ctx
            .local
            .upload_media(&self.mxid, response.body, mime, "avatar")
            .await?;
        ctx.local.set_avatar_url(&self.mxid, &content_uri).await?;
        Ok(Some(content_uri))
    }

    /// Binds a local account to this puppet for double puppeting.
    pub async fn set_custom_mxid(
        &self,
        ctx: &BridgeContext,
        custom_mxid: Option<String>,
        access_token: Option<String>,
        base_url: Option<String>,
    ) -> Result<()> {
        let mut record = self.record.write().await;
        record.custom_mxid = custom_mxid;
        record.access_token = access_token;
        record.base_url = base_url;
        record.next_batch = None;
        ctx.store.save_puppet(&record).await?;
        info!(
            target: "Bridge/Puppet",
            "Double puppet of {} is now {:?}",
            self.wxid,
            record.custom_mxid
        );
        Ok(())
    }

    /// Remembers the sync cursor of the bound local account.
    pub async fn set_next_batch(&self, ctx: &BridgeContext, next_batch: &str) -> Result<()> {
        let mut record = self.record.write().await;
        record.next_batch = Some(next_batch.to_string());
        ctx.store.save_puppet(&record).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_round_trips() {
        for id in ["wxid_abc123", "Alice.Smith", "user=name", "名字", "a__b"] {
            let escaped = escape_localpart(id);
            assert!(
                escaped
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._=-/".contains(c)),
                "{escaped}"
            );
            assert_eq!(unescape_localpart(&escaped).as_deref(), Some(id));
        }
        assert_eq!(escape_localpart("wxid_Ab"), "wxid___ab");
        assert_eq!(escape_localpart("a b"), "a=20b");
    }

    #[test]
    fn template_formats_and_parses() {
        let template = MxidTemplate::new("wechat_{userid}", "hs.local");
        let wxid = WechatId::from("wxid_Bob");
        let mxid = template.format(&wxid);
        assert_eq!(mxid, "@wechat_wxid___bob:hs.local");
        assert_eq!(template.parse(&mxid), Some(wxid));
        assert_eq!(template.parse("@wechat_x:elsewhere.org"), None);
        assert_eq!(template.parse("@someone:hs.local"), None);
        assert_eq!(template.parse("@wechat_:hs.local"), None);
    }

    #[test]
    fn malformed_escapes_are_rejected() {
        assert_eq!(unescape_localpart("abc_"), None);
        assert_eq!(unescape_localpart("a=zz"), None);
        assert_eq!(unescape_localpart("a_1"), None);
    }

    #[test]
    fn remarks_win_for_display() {
        let mut contact = Contact::new("wxid_a", "Alice");
        assert_eq!(contact_display_name(&contact), "Alice");
        contact.remarks = "Aunt Alice".to_string();
        assert_eq!(contact_display_name(&contact), "Aunt Alice");
        assert_eq!(contact_display_name(&Contact::new("wxid_b", "")), "wxid_b");
    }
}
