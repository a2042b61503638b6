use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable conversation key derived from an event's group/direction fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ChatId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One side of a delivery event: the sender, or the chat it was delivered in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Participant {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_business: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.map(str::to_string),
            is_business: false,
        }
    }

    /// The display name, ignoring blank values.
    pub fn name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Type-specific payload of a delivery event.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text {
        body: String,
    },
    Sticker {
        media_url: Option<String>,
    },
    Image {
        caption: Option<String>,
        media_url: Option<String>,
        mime_type: Option<String>,
    },
    Video {
        caption: Option<String>,
        media_url: Option<String>,
        seconds: Option<u32>,
    },
    Audio {
        media_url: Option<String>,
        seconds: Option<u32>,
    },
    Document {
        file_name: Option<String>,
        media_url: Option<String>,
        mime_type: Option<String>,
    },
    Location {
        name: Option<String>,
        address: Option<String>,
        latitude: f64,
        longitude: f64,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    Unknown,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Opaque reference to downloadable media, if the content carries any.
    pub fn media_url(&self) -> Option<&str> {
        match self {
            Self::Sticker { media_url }
            | Self::Image { media_url, .. }
            | Self::Video { media_url, .. }
            | Self::Audio { media_url, .. }
            | Self::Document { media_url, .. } => media_url.as_deref(),
            _ => None,
        }
    }
}

/// A raw delivery event as written to the event store by the ingestion path.
///
/// Immutable once written. The JSON shape keys the content sub-object by
/// message type name (`text`, `image`, `audio`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "wire::RawEventWire", into = "wire::RawEventWire")]
pub struct RawEvent {
    pub event_type: String,
    pub instance_id: String,
    /// Provider-assigned message id, when the provider sent one.
    pub message_id: Option<String>,
    pub from_me: bool,
    pub is_group: bool,
    /// Epoch seconds.
    pub moment: Option<i64>,
    pub sender: Participant,
    pub chat: Participant,
    /// Client-generated id echoed back by the provider for our own sends.
    pub correlation_id: Option<String>,
    pub content: MessageContent,
}

impl RawEvent {
    /// Parses one newline-delimited JSON record.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

mod wire {
    use serde::{Deserialize, Serialize};

    use super::{MessageContent, Participant, RawEvent};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub(super) struct RawEventWire {
        #[serde(rename = "event")]
        event_type: String,
        instance_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        from_me: bool,
        is_group: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        moment: Option<i64>,
        sender: Participant,
        chat: Participant,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<TextWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sticker: Option<MediaWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<MediaWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        video: Option<MediaWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<MediaWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        document: Option<MediaWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<LocationWire>,
        #[serde(skip_serializing_if = "Option::is_none")]
        poll: Option<PollWire>,
    }

    /// Text arrives either bare or wrapped as `{"message": "..."}`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(untagged)]
    enum TextWire {
        Wrapped { message: String },
        Bare(String),
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct MediaWire {
        #[serde(skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seconds: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    struct LocationWire {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        latitude: f64,
        longitude: f64,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct PollWire {
        question: String,
        options: Vec<String>,
    }

    impl From<RawEventWire> for RawEvent {
        fn from(wire: RawEventWire) -> Self {
            let content = if let Some(text) = wire.text {
                let body = match text {
                    TextWire::Wrapped { message } => message,
                    TextWire::Bare(body) => body,
                };
                MessageContent::Text { body }
            } else if let Some(sticker) = wire.sticker {
                MessageContent::Sticker {
                    media_url: sticker.media_url,
                }
            } else if let Some(image) = wire.image {
                MessageContent::Image {
                    caption: image.caption,
                    media_url: image.media_url,
                    mime_type: image.mime_type,
                }
            } else if let Some(video) = wire.video {
                MessageContent::Video {
                    caption: video.caption,
                    media_url: video.media_url,
                    seconds: video.seconds,
                }
            } else if let Some(audio) = wire.audio {
                MessageContent::Audio {
                    media_url: audio.media_url,
                    seconds: audio.seconds,
                }
            } else if let Some(document) = wire.document {
                MessageContent::Document {
                    file_name: document.file_name,
                    media_url: document.media_url,
                    mime_type: document.mime_type,
                }
            } else if let Some(location) = wire.location {
                MessageContent::Location {
                    name: location.name,
                    address: location.address,
                    latitude: location.latitude,
                    longitude: location.longitude,
                }
            } else if let Some(poll) = wire.poll {
                MessageContent::Poll {
                    question: poll.question,
                    options: poll.options,
                }
            } else {
                MessageContent::Unknown
            };

            RawEvent {
                event_type: wire.event_type,
                instance_id: wire.instance_id,
                message_id: wire.message_id.filter(|id| !id.is_empty()),
                from_me: wire.from_me,
                is_group: wire.is_group,
                moment: wire.moment,
                sender: wire.sender,
                chat: wire.chat,
                correlation_id: wire.correlation_id.filter(|id| !id.is_empty()),
                content,
            }
        }
    }

    impl From<RawEvent> for RawEventWire {
        fn from(event: RawEvent) -> Self {
            let mut wire = RawEventWire {
                event_type: event.event_type,
                instance_id: event.instance_id,
                message_id: event.message_id,
                from_me: event.from_me,
                is_group: event.is_group,
                moment: event.moment,
                sender: event.sender,
                chat: event.chat,
                correlation_id: event.correlation_id,
                ..Default::default()
            };

            match event.content {
                MessageContent::Text { body } => {
                    wire.text = Some(TextWire::Wrapped { message: body });
                }
                MessageContent::Sticker { media_url } => {
                    wire.sticker = Some(MediaWire {
                        media_url,
                        ..Default::default()
                    });
                }
                MessageContent::Image {
                    caption,
                    media_url,
                    mime_type,
                } => {
                    wire.image = Some(MediaWire {
                        caption,
                        media_url,
                        mime_type,
                        ..Default::default()
                    });
                }
                MessageContent::Video {
                    caption,
                    media_url,
                    seconds,
                } => {
                    wire.video = Some(MediaWire {
                        caption,
                        media_url,
                        seconds,
                        ..Default::default()
                    });
                }
                MessageContent::Audio { media_url, seconds } => {
                    wire.audio = Some(MediaWire {
                        media_url,
                        seconds,
                        ..Default::default()
                    });
                }
                MessageContent::Document {
                    file_name,
                    media_url,
                    mime_type,
                } => {
                    wire.document = Some(MediaWire {
                        file_name,
                        media_url,
                        mime_type,
                        ..Default::default()
                    });
                }
                MessageContent::Location {
                    name,
                    address,
                    latitude,
                    longitude,
                } => {
                    wire.location = Some(LocationWire {
                        name,
                        address,
                        latitude,
                        longitude,
                    });
                }
                MessageContent::Poll { question, options } => {
                    wire.poll = Some(PollWire { question, options });
                }
                MessageContent::Unknown => {}
            }

            wire
        }
    }
}
