//! Biddr wire protocol: the packet envelope and the domain objects it carries.
//!
//! Every message between client and server is one [`Packet`]: a
//! [`PacketType`] tag plus an optional [`Payload`]. Packets are immutable once
//! built and travel one per frame (see [`crate::network::PacketCodec`]).

pub use auction::{
    AuctionStatus, Bid, BidInfo, Direction, ItemInfo, Keyword, NewItem, Price, RegisterUser,
    SearchOptions, SortBy, UserInfo,
};
pub use packet::{Packet, PacketType, Payload, PROTOCOL_VERSION};

mod auction;
mod packet;
