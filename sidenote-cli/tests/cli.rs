use assert_cmd::Command;

#[test]
fn prints_help() {
    Command::cargo_bin("sidenote-cli")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn requires_a_document_argument() {
    Command::cargo_bin("sidenote-cli").unwrap().assert().failure();
}

#[test]
fn rejects_missing_document_file() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("sidenote-cli")
        .unwrap()
        .arg(dir.path().join("absent.txt"))
        .assert()
        .failure();
}

#[test]
fn rejects_malformed_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let document = dir.path().join("doc.txt");
    std::fs::write(&document, "page one\u{0c}page two").unwrap();
    let transcript = dir.path().join("responses.json");
    std::fs::write(&transcript, "{\"not\": \"an array\"}").unwrap();

    Command::cargo_bin("sidenote-cli")
        .unwrap()
        .arg("--responses")
        .arg(&transcript)
        .arg(&document)
        .assert()
        .failure();
}
