// Copyright (c) 2023 -  Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Ord, PartialOrd, Eq, PartialEq)]
pub enum Version {
    V1 = 1,
}

const CONTENT_TYPE_V1: &str = "application/vnd.restate.invocation.v1";

impl Version {
    pub const fn content_type(&self) -> &'static str {
        match self {
            Version::V1 => CONTENT_TYPE_V1,
        }
    }

    pub const fn minimum_supported_version() -> Self {
        Version::V1
    }

    pub const fn maximum_supported_version() -> Self {
        Version::V1
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.content_type())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ContentTypeError {
    #[error("unsupported protocol version '{0}'")]
    RestateContentType(String),
    #[error("unrecognized content-type '{0}', this is not a restate protocol content type. Make sure you're invoking the service through restate-server, rather than directly.")]
    OtherContentType(String),
}

impl FromStr for Version {
    type Err = ContentTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CONTENT_TYPE_V1 => Ok(Version::V1),
            s if s.starts_with("application/vnd.restate.invocation.") => {
                Err(ContentTypeError::RestateContentType(s.to_owned()))
            }
            s => Err(ContentTypeError::OtherContentType(s.to_owned())),
        }
    }
}
