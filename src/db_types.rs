use serde::{Deserialize, Serialize};
use std::str::FromStr;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
#[error("unrecognised value '{0}'")]
pub struct UnknownVariant(pub String);

/// Lifecycle of the phone call itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }
}

impl FromStr for CallState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CallState::Active),
            // older rows used "completed" for a finished call
            "ended" | "completed" => Ok(CallState::Ended),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Operator-set follow-up status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Completed,
    Callback,
    LiveCallAgent,
    LiveCallTeam,
    TicketRaised,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Completed => "completed",
            CallStatus::Callback => "callback",
            CallStatus::LiveCallAgent => "live_call_agent",
            CallStatus::LiveCallTeam => "live_call_team",
            CallStatus::TicketRaised => "ticket_raised",
        }
    }
}

impl FromStr for CallStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(CallStatus::Completed),
            "callback" => Ok(CallStatus::Callback),
            "live_call_agent" => Ok(CallStatus::LiveCallAgent),
            "live_call_team" => Ok(CallStatus::LiveCallTeam),
            "ticket_raised" => Ok(CallStatus::TicketRaised),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Pending,
    Available,
    Downloaded,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Pending => "pending",
            RecordingStatus::Available => "available",
            RecordingStatus::Downloaded => "downloaded",
        }
    }
}

impl FromStr for RecordingStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordingStatus::Pending),
            "available" => Ok(RecordingStatus::Available),
            "downloaded" => Ok(RecordingStatus::Downloaded),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Speaker {
    Customer,
    Agent,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Customer => "CUSTOMER",
            Speaker::Agent => "AGENT",
        }
    }

    /// Role name used when handing conversation context to the extractor.
    pub fn role(&self) -> &'static str {
        match self {
            Speaker::Customer => "customer",
            Speaker::Agent => "agent",
        }
    }
}

impl FromStr for Speaker {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CUSTOMER" => Ok(Speaker::Customer),
            "AGENT" | "AI_AGENT" => Ok(Speaker::Agent),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceCategory {
    SkipHire,
    ManAndVan,
    GrabHire,
    Roro,
    ToiletHire,
    WheelieBins,
    WasteBags,
    RoadSweeper,
}

impl ServiceCategory {
    pub const ALL: [ServiceCategory; 8] = [
        ServiceCategory::SkipHire,
        ServiceCategory::ManAndVan,
        ServiceCategory::GrabHire,
        ServiceCategory::Roro,
        ServiceCategory::ToiletHire,
        ServiceCategory::WheelieBins,
        ServiceCategory::WasteBags,
        ServiceCategory::RoadSweeper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceCategory::SkipHire => "Skip Hire",
            ServiceCategory::ManAndVan => "Man & Van",
            ServiceCategory::GrabHire => "Grab Hire",
            ServiceCategory::Roro => "RORO",
            ServiceCategory::ToiletHire => "Toilet Hire",
            ServiceCategory::WheelieBins => "Wheelie Bins",
            ServiceCategory::WasteBags => "Waste Bags",
            ServiceCategory::RoadSweeper => "Road Sweeper",
        }
    }
}

impl FromStr for ServiceCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace(" and ", " & ");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Free-text call fields the extractor may fill in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextField {
    CustomerName,
    Postcode,
    CustomerAddress,
    CustomerEmail,
    Service,
    SkipSize,
    WasteType,
    GrabMaterial,
    WhenNeeded,
}

impl TextField {
    pub fn column(&self) -> &'static str {
        match self {
            TextField::CustomerName => "customer_name",
            TextField::Postcode => "postcode",
            TextField::CustomerAddress => "customer_address",
            TextField::CustomerEmail => "customer_email",
            TextField::Service => "service",
            TextField::SkipSize => "skip_size",
            TextField::WasteType => "waste_type",
            TextField::GrabMaterial => "grab_material",
            TextField::WhenNeeded => "when_needed",
        }
    }
}

/// Boolean call flags; once true they stay true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagField {
    TradeCustomer,
    CallbackRequested,
    Complaint,
    QuoteProvided,
    BookingConfirmed,
    PaymentLinkSent,
}

impl FlagField {
    pub fn column(&self) -> &'static str {
        match self {
            FlagField::TradeCustomer => "trade_customer",
            FlagField::CallbackRequested => "callback_requested",
            FlagField::Complaint => "complaint",
            FlagField::QuoteProvided => "quote_provided",
            FlagField::BookingConfirmed => "booking_confirmed",
            FlagField::PaymentLinkSent => "payment_link_sent",
        }
    }
}

/// One conditional write produced by extraction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldUpdate {
    Text(TextField, String),
    Flag(FlagField),
}

impl FieldUpdate {
    pub fn column(&self) -> &'static str {
        match self {
            FieldUpdate::Text(field, _) => field.column(),
            FieldUpdate::Flag(flag) => flag.column(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CallRecord {
    pub id: i64,
    pub call_sid: String,
    pub display_id: String,
    pub from_number: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub state: CallState,
    pub call_status: CallStatus,

    pub customer_name: Option<String>,
    pub postcode: Option<String>,
    pub customer_address: Option<String>,
    pub customer_email: Option<String>,

    pub service: Option<String>,
    pub skip_size: Option<String>,
    pub waste_type: Option<String>,
    pub grab_material: Option<String>,
    pub when_needed: Option<String>,

    pub trade_customer: bool,
    pub callback_requested: bool,
    pub complaint: bool,
    pub quote_provided: bool,
    pub booking_confirmed: bool,
    pub payment_link_sent: bool,

    pub recording_sid: Option<String>,
    pub recording_url: Option<String>,
    pub recording_duration: i32,
    pub recording_path: Option<String>,
    pub recording_status: RecordingStatus,

    pub team_notes: Option<String>,
}

impl CallRecord {
    pub fn new(id: i64, call_sid: &str, from_number: Option<&str>, display_id: &str) -> Self {
        Self {
            id,
            call_sid: call_sid.to_string(),
            display_id: display_id.to_string(),
            from_number: from_number.map(str::to_string),
            start_time: OffsetDateTime::now_utc(),
            state: CallState::Active,
            call_status: CallStatus::Completed,
            customer_name: None,
            postcode: None,
            customer_address: None,
            customer_email: None,
            service: None,
            skip_size: None,
            waste_type: None,
            grab_material: None,
            when_needed: None,
            trade_customer: false,
            callback_requested: false,
            complaint: false,
            quote_provided: false,
            booking_confirmed: false,
            payment_link_sent: false,
            recording_sid: None,
            recording_url: None,
            recording_duration: 0,
            recording_path: None,
            recording_status: RecordingStatus::Pending,
            team_notes: None,
        }
    }

    pub fn text_mut(&mut self, field: TextField) -> &mut Option<String> {
        match field {
            TextField::CustomerName => &mut self.customer_name,
            TextField::Postcode => &mut self.postcode,
            TextField::CustomerAddress => &mut self.customer_address,
            TextField::CustomerEmail => &mut self.customer_email,
            TextField::Service => &mut self.service,
            TextField::SkipSize => &mut self.skip_size,
            TextField::WasteType => &mut self.waste_type,
            TextField::GrabMaterial => &mut self.grab_material,
            TextField::WhenNeeded => &mut self.when_needed,
        }
    }

    pub fn flag_mut(&mut self, flag: FlagField) -> &mut bool {
        match flag {
            FlagField::TradeCustomer => &mut self.trade_customer,
            FlagField::CallbackRequested => &mut self.callback_requested,
            FlagField::Complaint => &mut self.complaint,
            FlagField::QuoteProvided => &mut self.quote_provided,
            FlagField::BookingConfirmed => &mut self.booking_confirmed,
            FlagField::PaymentLinkSent => &mut self.payment_link_sent,
        }
    }

    /// Apply `update` only if the target is still unset.  Returns whether it was written.
    pub fn fill(&mut self, update: &FieldUpdate) -> bool {
        match update {
            FieldUpdate::Text(field, value) => {
                let slot = self.text_mut(*field);
                if slot.as_deref().map_or(true, str::is_empty) {
                    *slot = Some(value.clone());
                    true
                } else {
                    false
                }
            }
            FieldUpdate::Flag(flag) => {
                let slot = self.flag_mut(*flag);
                if *slot {
                    false
                } else {
                    *slot = true;
                    true
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TranscriptEntry {
    pub id: i64,
    pub call_sid: String,
    pub speaker: Speaker,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

pub struct NewRecording {
    pub recording_sid: String,
    pub recording_url: String,
    pub duration_seconds: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct CallStats {
    pub total_calls: i64,
    pub today_calls: i64,
    pub active_calls: i64,
    pub callbacks: i64,
    pub complaints: i64,
    pub trade_customers: i64,
    pub quotes: i64,
    pub bookings: i64,
    pub tickets_raised: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CallWithTranscript {
    pub call_info: CallRecord,
    pub transcripts: Vec<TranscriptEntry>,
}
