pub fn wrap_twiml(twiml: String) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{twiml}")
}

mod twiml {
    use xmlserde_derives::XmlSerialize;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub actions: Vec<ResponseAction>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ResponseAction {
        #[xmlserde(name = b"Start")]
        Start(StartAction),
        #[xmlserde(name = b"Pause")]
        Pause(PauseAction),
        #[xmlserde(name = b"Dial")]
        Dial(DialAction),
        #[xmlserde(name = b"Say")]
        Say(SayAction),
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct StartAction {
        #[xmlserde(ty = "untag")]
        pub nouns: Vec<StartNoun>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum StartNoun {
        #[xmlserde(name = b"Transcription")]
        Transcription(TranscriptionNoun),
    }

    /// Real-time transcription; fragments are posted to `status_callback_url`.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct TranscriptionNoun {
        #[xmlserde(name = b"statusCallbackUrl", ty = "attr")]
        pub status_callback_url: String,
        #[xmlserde(name = b"track", ty = "attr")]
        pub track: Option<String>,
        #[xmlserde(name = b"partialResults", ty = "attr")]
        pub partial_results: Option<String>,
        #[xmlserde(name = b"languageCode", ty = "attr")]
        pub language_code: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct PauseAction {
        #[xmlserde(name = b"length", ty = "attr")]
        pub length: Option<u16>,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct DialAction {
        #[xmlserde(name = b"timeout", ty = "attr")]
        pub timeout: Option<u16>,
        #[xmlserde(name = b"record", ty = "attr")]
        pub record: Option<String>,
        #[xmlserde(name = b"recordingStatusCallback", ty = "attr")]
        pub recording_status_callback: Option<String>,
        #[xmlserde(name = b"recordingStatusCallbackMethod", ty = "attr")]
        pub recording_status_callback_method: Option<String>,
        #[xmlserde(ty = "untag")]
        pub nouns: Vec<DialNoun>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum DialNoun {
        #[xmlserde(name = b"Number")]
        Number(NumberNoun),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct NumberNoun {
        #[xmlserde(ty = "text")]
        pub number: String,
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct SayAction {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
        #[xmlserde(name = b"language", ty = "attr")]
        pub language: Option<String>,
    }
}
pub use twiml::*;

mod webhook {
    use serde::Deserialize;

    /// Voice webhook posted when a call reaches our number.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct IncomingCallPayload {
        pub call_sid: String,
        #[serde(default)]
        pub from: Option<String>,
        #[serde(default)]
        pub to: Option<String>,
    }

    #[derive(Deserialize, Debug, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum TranscriptionEvent {
        TranscriptionStarted,
        TranscriptionContent,
        TranscriptionStopped,
        TranscriptionError,
        #[serde(other)]
        Other,
    }

    #[derive(Deserialize, Debug, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub enum TranscriptionTrack {
        InboundTrack,
        OutboundTrack,
        #[serde(other)]
        Unknown,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TranscriptionPayload {
        pub call_sid: String,
        pub transcription_event: TranscriptionEvent,
        /// JSON document; see `TranscriptionData`.
        #[serde(default)]
        pub transcription_data: Option<String>,
        #[serde(default)]
        pub track: Option<TranscriptionTrack>,
        #[serde(rename = "Final", default)]
        pub is_final: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct TranscriptionData {
        #[serde(default)]
        pub transcript: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct RecordingPayload {
        pub call_sid: String,
        pub recording_sid: String,
        pub recording_url: String,
        #[serde(default)]
        pub recording_duration: Option<String>,
    }
}
pub use webhook::*;

impl TranscriptionPayload {
    pub fn is_final(&self) -> bool {
        self.is_final
            .as_deref()
            .map_or(false, |v| v.trim().eq_ignore_ascii_case("true"))
    }

    /// Fragment text, empty when the data blob is missing or unparseable.
    pub fn transcript(&self) -> String {
        self.transcription_data
            .as_deref()
            .and_then(|data| serde_json::from_str::<TranscriptionData>(data).ok())
            .map(|data| data.transcript)
            .unwrap_or_default()
    }
}

impl RecordingPayload {
    pub fn duration_seconds(&self) -> i32 {
        self.recording_duration
            .as_deref()
            .and_then(|d| d.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Twilio serves the recording as mp3 when the extension is appended.
    pub fn playable_url(&self) -> String {
        if self.recording_url.ends_with(".mp3") {
            self.recording_url.clone()
        } else {
            format!("{}.mp3", self.recording_url)
        }
    }
}

/// TwiML answering an inbound call: start transcription on both tracks, then dial through
/// with recording enabled.
pub fn inbound_call_twiml(base_url: &str, forward_number: &str, apology: &str) -> String {
    let transcription = TranscriptionNoun {
        status_callback_url: format!("{base_url}/voice/transcription"),
        track: Some("both_tracks".to_string()),
        partial_results: Some("true".to_string()),
        language_code: Some("en-GB".to_string()),
    };
    let dial = DialAction {
        timeout: Some(30),
        record: Some("record-from-answer".to_string()),
        recording_status_callback: Some(format!("{base_url}/voice/recording-callback")),
        recording_status_callback_method: Some("POST".to_string()),
        nouns: vec![DialNoun::Number(NumberNoun {
            number: forward_number.to_string(),
        })],
    };
    let say = SayAction {
        text: apology.to_string(),
        voice: Some("alice".to_string()),
        ..Default::default()
    };
    let response = Response {
        actions: vec![
            ResponseAction::Start(StartAction {
                nouns: vec![StartNoun::Transcription(transcription)],
            }),
            ResponseAction::Pause(PauseAction { length: Some(1) }),
            ResponseAction::Dial(dial),
            ResponseAction::Say(say),
        ],
    };

    wrap_twiml(xmlserde::xml_serialize(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_twiml_starts_transcription_and_records() {
        let twiml = inbound_call_twiml(
            "https://calls.example.com",
            "+447000000000",
            "Sorry, nobody can take your call.",
        );
        assert!(twiml.starts_with("<?xml"));
        assert!(twiml.contains("<Response"));
        assert!(twiml.contains("<Transcription"));
        assert!(twiml.contains(r#"statusCallbackUrl="https://calls.example.com/voice/transcription""#));
        assert!(twiml.contains(r#"track="both_tracks""#));
        assert!(twiml.contains(r#"record="record-from-answer""#));
        assert!(twiml.contains(
            r#"recordingStatusCallback="https://calls.example.com/voice/recording-callback""#
        ));
        assert!(twiml.contains("<Number"));
        assert!(twiml.contains("+447000000000</Number>"));
        assert!(twiml.contains("Sorry, nobody can take your call."));
        let start = twiml.find("<Start").unwrap();
        let dial = twiml.find("<Dial").unwrap();
        assert!(start < dial);
    }

    #[test]
    fn transcription_form_decodes() {
        let body = "CallSid=CA123&TranscriptionEvent=transcription-content\
                    &TranscriptionData=%7B%22transcript%22%3A%22hello+there%22%2C%22confidence%22%3A0.9%7D\
                    &Track=inbound_track&Final=true";
        let payload: TranscriptionPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.call_sid, "CA123");
        assert_eq!(payload.transcription_event, TranscriptionEvent::TranscriptionContent);
        assert_eq!(payload.track, Some(TranscriptionTrack::InboundTrack));
        assert!(payload.is_final());
        assert_eq!(payload.transcript(), "hello there");
    }

    #[test]
    fn unexpected_event_and_track_values_decode() {
        let body = "CallSid=CA1&TranscriptionEvent=transcription-paused&Track=mixed&Final=False";
        let payload: TranscriptionPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.transcription_event, TranscriptionEvent::Other);
        assert_eq!(payload.track, Some(TranscriptionTrack::Unknown));
        assert!(!payload.is_final());
        assert_eq!(payload.transcript(), "");
    }

    #[test]
    fn recording_form_decodes() {
        let body = "CallSid=CA1&RecordingSid=RE1\
                    &RecordingUrl=https%3A%2F%2Fapi.twilio.com%2Frec%2FRE1&RecordingDuration=42";
        let payload: RecordingPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.duration_seconds(), 42);
        assert_eq!(payload.playable_url(), "https://api.twilio.com/rec/RE1.mp3");
    }
}
