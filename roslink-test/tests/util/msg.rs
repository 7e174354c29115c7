//! Message and service types used across the integration tests. A message
//! generator would normally produce these; they are hand-assembled here to
//! keep the tests self-contained.

// Not every test binary uses every helper.
#![allow(dead_code)]

use roslink::{
    action::ActionType,
    msg::{DynamicMessage, FieldSpec, FieldType, MessageSchema, MessageType, Value},
    tcpros::service::ServiceType,
};

/// `std_msgs/String`, with its canonical fingerprint.
pub fn ros_string() -> MessageType {
    MessageType::with_md5(
        "std_msgs/String",
        "string data\n",
        "992ce8a1687cec8c8bd883ec73ca41d1",
        MessageSchema::new(vec![FieldSpec::scalar("data", FieldType::String)]),
    )
}

pub fn string_msg(msg_type: &MessageType, data: &str) -> DynamicMessage {
    let mut msg = msg_type.new_message();
    msg.set("data", Value::String(data.to_string())).unwrap();
    msg
}

pub fn string_data(msg: &DynamicMessage) -> String {
    msg.get("data").unwrap().as_str().unwrap().to_string()
}

/// An add-two-ints service in the style of `test_msgs/TwoInts`.
pub fn two_ints() -> ServiceType {
    let request = MessageType::dynamic(
        "test_msgs/TwoIntsReq",
        "int64 a\nint64 b\n",
        MessageSchema::new(vec![
            FieldSpec::scalar("a", FieldType::I64),
            FieldSpec::scalar("b", FieldType::I64),
        ]),
    );

    let response = MessageType::dynamic(
        "test_msgs/TwoIntsRes",
        "int64 sum\n",
        MessageSchema::new(vec![FieldSpec::scalar("sum", FieldType::I64)]),
    );

    ServiceType::dynamic("test_msgs/TwoInts", request, response)
}

pub fn two_ints_request(srv: &ServiceType, a: i64, b: i64) -> DynamicMessage {
    let mut msg = srv.request().new_message();
    msg.set("a", Value::I64(a)).unwrap();
    msg.set("b", Value::I64(b)).unwrap();
    msg
}

/// The classic Fibonacci tutorial action.
pub fn fibonacci() -> ActionType {
    let goal = MessageType::dynamic(
        "test_msgs/FibonacciGoal",
        "int32 order\n",
        MessageSchema::new(vec![FieldSpec::scalar("order", FieldType::I32)]),
    );

    let result = MessageType::dynamic(
        "test_msgs/FibonacciResult",
        "int32[] sequence\n",
        MessageSchema::new(vec![FieldSpec::dynamic_array("sequence", FieldType::I32)]),
    );

    let feedback = MessageType::dynamic(
        "test_msgs/FibonacciFeedback",
        "int32[] sequence\n",
        MessageSchema::new(vec![FieldSpec::dynamic_array("sequence", FieldType::I32)]),
    );

    ActionType::new("test_msgs/Fibonacci", &goal, &result, &feedback)
}

pub fn fibonacci_goal(action: &ActionType, order: i32) -> DynamicMessage {
    let goal_schema = nested_schema(action.goal(), "goal");
    let mut msg = DynamicMessage::new(goal_schema);
    msg.set("order", Value::I32(order)).unwrap();
    msg
}

pub fn fibonacci_result(action: &ActionType, sequence: &[i32]) -> DynamicMessage {
    let result_schema = nested_schema(action.result(), "result");
    let mut msg = DynamicMessage::new(result_schema);
    msg.set(
        "sequence",
        Value::Array(sequence.iter().map(|v| Value::I32(*v)).collect()),
    )
    .unwrap();
    msg
}

/// Pull the schema of a nested field out of a wrapper message type.
pub fn nested_schema(
    msg_type: &MessageType,
    field: &str,
) -> std::sync::Arc<MessageSchema> {
    match &msg_type.schema().field(field).unwrap().ty {
        FieldType::Nested(schema) => schema.clone(),
        other => panic!("field \"{field}\" is not a nested message: {other:?}"),
    }
}
