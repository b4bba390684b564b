//! Prompt construction and response parsing shared by all providers

use obd_core::{AiProviderError, CodeKind};

use super::{EnrichmentRequest, EnrichmentResponse};

pub const SYSTEM_PROMPT: &str = "You are an expert automotive diagnostic assistant. \
You analyze OBD-II trouble codes and sensor data and answer with a single JSON object only.";

const RESPONSE_FORMAT: &str = r#"Format your response as a JSON object with the following structure:
{
  "diagnoses": [
    {
      "name": "Short name of the diagnosis",
      "description": "Detailed description of the problem",
      "confidence": 0.0-1.0,
      "severity": "critical|high|medium|low|none",
      "codes": ["Trouble codes this diagnosis explains"]
    }
  ],
  "severity": "critical|high|medium|low|none",
  "diy_repairs": [
    {
      "issue_name": "Name of the issue being repaired",
      "repair_name": "Name of the repair procedure",
      "description": "Detailed description of the repair",
      "difficulty": 1-5,
      "estimated_cost": "$XX-$YY",
      "steps": ["Step 1", "Step 2"]
    }
  ],
  "professional_repairs": [
    {
      "issue_name": "Name of the issue being repaired",
      "repair_name": "Name of the repair procedure",
      "description": "Detailed description of the repair",
      "estimated_cost": "$XX-$YY"
    }
  ],
  "safety_warnings": [
    {
      "text": "Warning text",
      "issue_name": "Related issue"
    }
  ],
  "summary": "Two or three sentences for the vehicle owner"
}

Provide only the JSON response, with no additional text before or after."#;

fn or_unknown<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// User prompt describing the vehicle, its codes and a sensor sample
pub fn build_user_prompt(request: &EnrichmentRequest) -> String {
    let vehicle = &request.vehicle;
    let mut prompt = String::from(
        "You're analyzing diagnostic trouble codes for a vehicle and will provide a detailed analysis.\n\n",
    );

    prompt.push_str("Vehicle Information:\n");
    prompt.push_str(&format!("- Year: {}\n", or_unknown(vehicle.year)));
    prompt.push_str(&format!("- Make: {}\n", or_unknown(vehicle.make.as_deref())));
    prompt.push_str(&format!("- Model: {}\n", or_unknown(vehicle.model.as_deref())));
    prompt.push_str(&format!("- Mileage: {}\n", or_unknown(vehicle.mileage)));
    prompt.push_str(&format!(
        "- VIN: {}\n",
        or_unknown(request.vehicle_info.vin.as_deref())
    ));
    if let Some(protocol) = &request.vehicle_info.protocol {
        prompt.push_str(&format!("- OBD protocol: {}\n", protocol));
    }

    prompt.push_str("\nDiagnostic Trouble Codes:\n");
    for code in &request.codes {
        let kind = match code.kind {
            CodeKind::Stored => "stored",
            CodeKind::Pending => "pending",
            CodeKind::Permanent => "permanent",
        };
        prompt.push_str(&format!(
            "- {}: {} (Type: {}, catalog severity: {})\n",
            code.code, code.description, kind, code.severity
        ));
    }

    if !request.sensors.is_empty() {
        prompt.push_str("\nLive Sensor Sample:\n");
        for reading in &request.sensors {
            prompt.push_str(&format!(
                "- {}: {:.1} {} ({:?})\n",
                reading.name, reading.value, reading.unit, reading.trend
            ));
        }
    }
    if !request.observations.is_empty() {
        prompt.push_str("\nNotable Readings:\n");
        for observation in &request.observations {
            prompt.push_str(&format!("- {}\n", observation.message));
        }
    }

    prompt.push_str(
        "\nBased on these codes and the vehicle information, please provide:\n\
         1. A detailed analysis of the likely problems in the vehicle\n\
         2. The severity of the issues\n\
         3. Recommended repair options, including DIY fixes where possible\n\
         4. Estimated costs for repairs\n\
         5. Any safety warnings the owner should be aware of\n\n",
    );
    prompt.push_str(RESPONSE_FORMAT);
    prompt
}

/// Parse the model's text, tolerating prose or code fences around the JSON object
pub fn parse_response(provider: &str, text: &str) -> Result<EnrichmentResponse, AiProviderError> {
    let invalid = |message: String| AiProviderError::InvalidResponse {
        provider: provider.to_string(),
        message,
    };

    match serde_json::from_str::<EnrichmentResponse>(text.trim()) {
        Ok(response) => Ok(response),
        Err(direct) => {
            let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
                return Err(invalid(format!("no JSON object in response: {}", direct)));
            };
            if end < start {
                return Err(invalid(format!("no JSON object in response: {}", direct)));
            }
            serde_json::from_str(&text[start..=end]).map_err(|e| invalid(e.to_string()))
        }
    }
}
