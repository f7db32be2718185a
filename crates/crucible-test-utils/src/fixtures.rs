//! Test fixtures: BPMN resources and identifiers.

use uuid::Uuid;

const BPMN_NAMESPACE: &str = "http://www.omg.org/spec/BPMN/20100524/MODEL";
const ZEEBE_NAMESPACE: &str = "http://camunda.org/schema/zeebe/1.0";

#[derive(Debug, Clone)]
enum Step {
    ServiceTask { id: String, job_type: String },
    UserTask { id: String },
}

impl Step {
    fn id(&self) -> &str {
        match self {
            Step::ServiceTask { id, .. } | Step::UserTask { id } => id,
        }
    }
}

/// Builder for a linear executable BPMN process.
///
/// ```rust,ignore
/// let bpmn = BpmnProcess::new("order")
///     .service_task("charge", "payment")
///     .user_task("approve")
///     .to_xml();
/// ```
#[derive(Debug, Clone)]
pub struct BpmnProcess {
    id: String,
    steps: Vec<Step>,
}

impl BpmnProcess {
    /// Process with only a start and an end event.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn service_task(mut self, id: impl Into<String>, job_type: impl Into<String>) -> Self {
        self.steps.push(Step::ServiceTask {
            id: id.into(),
            job_type: job_type.into(),
        });
        self
    }

    #[must_use]
    pub fn user_task(mut self, id: impl Into<String>) -> Self {
        self.steps.push(Step::UserTask { id: id.into() });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resource name to deploy the process under.
    pub fn resource_name(&self) -> String {
        format!("{}.bpmn", self.id)
    }

    pub fn to_xml(&self) -> String {
        let mut nodes = vec!["start".to_string()];
        nodes.extend(self.steps.iter().map(|step| step.id().to_string()));
        nodes.push("end".to_string());

        let mut body = String::from("    <bpmn:startEvent id=\"start\"/>\n");
        for step in &self.steps {
            match step {
                Step::ServiceTask { id, job_type } => body.push_str(&format!(
                    "    <bpmn:serviceTask id=\"{id}\">\n      <bpmn:extensionElements>\n        <zeebe:taskDefinition type=\"{job_type}\"/>\n      </bpmn:extensionElements>\n    </bpmn:serviceTask>\n"
                )),
                Step::UserTask { id } => body.push_str(&format!(
                    "    <bpmn:userTask id=\"{id}\">\n      <bpmn:extensionElements>\n        <zeebe:userTask/>\n      </bpmn:extensionElements>\n    </bpmn:userTask>\n"
                )),
            }
        }
        body.push_str("    <bpmn:endEvent id=\"end\"/>\n");

        for (index, pair) in nodes.windows(2).enumerate() {
            body.push_str(&format!(
                "    <bpmn:sequenceFlow id=\"flow{index}\" sourceRef=\"{}\" targetRef=\"{}\"/>\n",
                pair[0], pair[1]
            ));
        }

        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <bpmn:definitions xmlns:bpmn=\"{BPMN_NAMESPACE}\" xmlns:zeebe=\"{ZEEBE_NAMESPACE}\" id=\"definitions_{id}\" targetNamespace=\"http://bpmn.io/schema/bpmn\">\n  \
             <bpmn:process id=\"{id}\" isExecutable=\"true\">\n{body}  </bpmn:process>\n\
             </bpmn:definitions>\n",
            id = self.id
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_xml().into_bytes()
    }
}

/// Process id unique to one test run, e.g. `order-1a2b3c4d`.
pub fn unique_process_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..8])
}
