//! Wire types shared between the manor hub and its application instances.
//!
//! Everything in this crate is plain data: the JSON envelopes of the
//! database proxy channel, the request/response bodies of the instance and
//! hub HTTP APIs, and the header/cookie names both sides must agree on.
//! No I/O happens here.

pub mod api;
pub mod dbproxy;

pub use api::{
    CheckAccessRequest, CheckAccessResponse, CrossServiceRequest, CrossServiceResponse,
    DoLoginRequest, DoLoginResponse, ErrorBody, GuestHttpRequest, GuestHttpResponse,
    InstanceDescriptor, ListInstancesResponse, LoginRequest, LoginResponse, PublishResponse,
    PublishStatus, RefreshResponse, StatusResponse, UploadStatusResponse,
};
pub use dbproxy::{DbCommand, DbRequest, DbResponse};
