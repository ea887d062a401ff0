use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auction::{Bid, ItemInfo, Keyword, NewItem, RegisterUser, SearchOptions, UserInfo};

/// Version spoken by this build; exchanged in the VERSION step of the handshake.
pub const PROTOCOL_VERSION: i64 = 1;

/// Tag carried by every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    // handshake
    Hello,
    Version,
    Ok,
    Nok,
    Secure,
    Disconnect,
    Ping,

    // session
    Login,
    LoginSuccess,
    LoginFail,
    Logout,
    Register,
    RegisterSuccess,
    RegisterFail,

    // auctions
    CreateItem,
    CreateItemSuccess,
    CreateItemFail,
    PlaceBid,
    PlaceBidSuccess,
    PlaceBidFail,
    Search,
    SearchResults,
    FetchItem,
    Item,
    FetchUser,
    User,
    FetchUserBids,
    UserBids,
    FetchSellerList,
    SellerList,
    FetchKeywords,
    Keywords,
    FetchReserveRange,
    ReserveRange,
    AuctionStart,
    AuctionEnd,
    AuctionWin,
    AuctionNoWinner,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed body of a packet. Which variant goes with which [`PacketType`] is
/// fixed by the dispatch table on the server and the handshake handlers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Number(i64),
    Id(Uuid),
    /// `[username, password]`
    Credentials(Vec<String>),
    Registration(RegisterUser),
    User(UserInfo),
    NewItem(NewItem),
    Item(ItemInfo),
    Items(Vec<ItemInfo>),
    Bid(Bid),
    Search(SearchOptions),
    Keywords(Vec<Keyword>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Payload::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<Uuid> {
        match self {
            Payload::Id(id) => Some(*id),
            _ => None,
        }
    }
}

/// The unit of exchange between client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    packet_type: PacketType,
    #[serde(default)]
    payload: Payload,
}

impl Packet {
    pub fn new(packet_type: PacketType) -> Self {
        Packet {
            packet_type,
            payload: Payload::Empty,
        }
    }

    pub fn with_payload(packet_type: PacketType, payload: Payload) -> Self {
        Packet {
            packet_type,
            payload,
        }
    }

    /// Packet whose payload is a reason or message string.
    pub fn with_text(packet_type: PacketType, text: impl Into<String>) -> Self {
        Packet::with_payload(packet_type, Payload::Text(text.into()))
    }

    pub fn hello(greeting: impl Into<String>) -> Self {
        Packet::with_text(PacketType::Hello, greeting)
    }

    pub fn version(version: i64) -> Self {
        Packet::with_payload(PacketType::Version, Payload::Number(version))
    }

    /// OK when `ok`, NOK otherwise.
    pub fn was_ok(ok: bool) -> Self {
        Packet::new(if ok { PacketType::Ok } else { PacketType::Nok })
    }

    pub fn secure(port: u16) -> Self {
        Packet::with_payload(PacketType::Secure, Payload::Number(i64::from(port)))
    }

    pub fn disconnect(reason: impl Into<String>) -> Self {
        Packet::with_text(PacketType::Disconnect, reason)
    }

    pub fn ping() -> Self {
        Packet::new(PacketType::Ping)
    }

    pub fn logout() -> Self {
        Packet::new(PacketType::Logout)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn is(&self, packet_type: PacketType) -> bool {
        self.packet_type == packet_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn was_ok_picks_the_verdict_type() {
        assert!(Packet::was_ok(true).is(PacketType::Ok));
        assert!(Packet::was_ok(false).is(PacketType::Nok));
    }

    #[test]
    fn json_form_is_tagged() {
        let json = serde_json::to_string(&Packet::version(3)).unwrap();
        assert_eq!(
            json,
            r#"{"packet_type":"VERSION","payload":{"kind":"number","value":3}}"#
        );
    }

    #[test]
    fn missing_payload_decodes_as_empty() {
        let packet: Packet = serde_json::from_str(r#"{"packet_type":"PING"}"#).unwrap();
        assert_eq!(packet, Packet::ping());
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = serde_json::from_str::<Packet>(r#"{"packet_type":"TELEPORT"}"#);
        assert!(result.is_err());
    }
}
