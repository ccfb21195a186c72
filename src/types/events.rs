use wxcore::{RemoteMessage, WechatUser};

/// Events the client hands to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    /// The connection dropped without being asked to.
    Disconnected,
    /// The box reported a logged-in account.
    LoggedIn(WechatUser),
    Message(RemoteMessage),
}
