pub mod call;
pub mod signaling;

pub use call::{CallId, CallInfo, Side};
pub use signaling::{
    AnswerEvent, Candidate, CandidatesEvent, HangupEvent, InviteEvent, SessionDescription,
    SignalingEvent,
};
